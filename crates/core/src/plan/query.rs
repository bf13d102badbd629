use crate::plan::LogicalDetails;
use crate::plan::LogicalOperator;
use crate::plan::OperatorId;
use std::collections::BTreeMap;
use std::fmt;

/// A logical query plan: an arena of operators wired into a DAG.
///
/// Children are the inputs of an operator; parents are its consumers. The
/// plan is built sources-first, so child ids always precede parent ids.
#[derive(Clone, Debug, Default)]
pub struct QueryPlan {
	nodes: BTreeMap<OperatorId, LogicalOperator>,
	next_id: u64,
}

impl QueryPlan {
	/// Creates an empty plan
	pub fn new() -> Self {
		QueryPlan::default()
	}

	/// The next unused operator id
	pub fn next_operator_id(&mut self) -> OperatorId {
		let id = OperatorId(self.next_id);
		self.next_id += 1;
		id
	}

	/// Adds an operator consuming the given children, returning its id
	pub fn add(&mut self, details: LogicalDetails, children: &[OperatorId]) -> OperatorId {
		let id = self.next_operator_id();
		self.add_with_id(id, details, children);
		id
	}

	/// Adds an operator with an explicit id, as done when deserializing a
	/// subplan that must keep its identities
	pub fn add_with_id(&mut self, id: OperatorId, details: LogicalDetails, children: &[OperatorId]) {
		let mut node = LogicalOperator::new(id, details);
		node.children = children.to_vec();
		for child in children {
			if let Some(child) = self.nodes.get_mut(child) {
				child.parents.push(id);
			}
		}
		self.next_id = self.next_id.max(id.0 + 1);
		self.nodes.insert(id, node);
	}

	/// The operator with the given id
	pub fn node(&self, id: OperatorId) -> Option<&LogicalOperator> {
		self.nodes.get(&id)
	}

	/// The operator with the given id, mutably
	pub fn node_mut(&mut self, id: OperatorId) -> Option<&mut LogicalOperator> {
		self.nodes.get_mut(&id)
	}

	/// All operators in id order
	pub fn nodes(&self) -> impl Iterator<Item = &LogicalOperator> {
		self.nodes.values()
	}

	/// The number of operators in the plan
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	/// Whether the plan holds no operators
	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// The ids of all operators without parents (the sinks)
	pub fn roots(&self) -> Vec<OperatorId> {
		self.nodes.values().filter(|n| n.parents.is_empty()).map(|n| n.id).collect()
	}

	/// The ids of all source operators
	pub fn sources(&self) -> Vec<OperatorId> {
		self.nodes
			.values()
			.filter(|n| matches!(n.details, LogicalDetails::Source { .. }))
			.map(|n| n.id)
			.collect()
	}

	/// All operator ids ordered so that every child precedes its parents
	pub fn topological(&self) -> Vec<OperatorId> {
		let mut order = Vec::with_capacity(self.nodes.len());
		let mut visited = std::collections::HashSet::new();
		let mut stack: Vec<(OperatorId, bool)> = self.roots().into_iter().map(|id| (id, false)).collect();
		while let Some((id, expanded)) = stack.pop() {
			if visited.contains(&id) {
				continue;
			}
			if expanded {
				visited.insert(id);
				order.push(id);
				continue;
			}
			stack.push((id, true));
			if let Some(node) = self.nodes.get(&id) {
				for child in node.children.iter().rev() {
					if !visited.contains(child) {
						stack.push((*child, false));
					}
				}
			}
		}
		order
	}
}

impl fmt::Display for QueryPlan {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for node in self.nodes.values() {
			write!(f, "{node}")?;
			if !node.children.is_empty() {
				write!(f, " <- [")?;
				for (idx, child) in node.children.iter().enumerate() {
					if idx > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{child}")?;
				}
				write!(f, "]")?;
			}
			writeln!(f)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::Expr;
	use crate::plan::OriginId;
	use crate::plan::SinkDescriptor;
	use crate::plan::SinkType;
	use crate::plan::SourceDescriptor;
	use crate::plan::SourceType;
	use crate::sch::Kind;
	use crate::sch::Schema;
	use crate::sch::Value;

	#[test]
	fn builds_a_linear_plan() {
		let schema = Schema::from_fields([("cars$id", Kind::U32)]).unwrap();
		let mut plan = QueryPlan::new();
		let source = plan.add(
			LogicalDetails::Source {
				descriptor: SourceDescriptor::new("cars", SourceType::Csv, schema),
				origin: OriginId(1),
			},
			&[],
		);
		let filter = plan.add(
			LogicalDetails::Filter {
				predicate: Expr::binary(
					Expr::field("id"),
					crate::plan::BinaryOperator::LessThan,
					Expr::Constant(Value::U32(45)),
				),
			},
			&[source],
		);
		let sink = plan.add(
			LogicalDetails::Sink {
				descriptor: SinkDescriptor::new(SinkType::Print),
			},
			&[filter],
		);
		assert_eq!(plan.roots(), vec![sink]);
		assert_eq!(plan.topological(), vec![source, filter, sink]);
		assert_eq!(plan.node(filter).unwrap().parents, vec![sink]);
	}
}
