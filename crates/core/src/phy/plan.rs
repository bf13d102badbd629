use crate::phy::operator::PhysicalDetails;
use crate::phy::operator::PhysicalOperator;
use crate::plan::OperatorId;
use crate::sch::Schema;
use std::collections::BTreeMap;
use std::fmt;

/// A physical execution plan: the lowered form of one logical query plan
#[derive(Default)]
pub struct PhysicalPlan {
	nodes: BTreeMap<OperatorId, PhysicalOperator>,
	next_id: u64,
}

impl PhysicalPlan {
	pub fn new(first_free_id: u64) -> Self {
		PhysicalPlan {
			nodes: BTreeMap::new(),
			next_id: first_free_id,
		}
	}

	/// Adds a physical operator with a fresh id
	pub fn add(
		&mut self,
		details: PhysicalDetails,
		children: &[OperatorId],
		input_schema: Schema,
		output_schema: Schema,
	) -> OperatorId {
		let id = OperatorId(self.next_id);
		self.next_id += 1;
		self.add_with_id(id, details, children, input_schema, output_schema);
		id
	}

	/// Adds a physical operator keeping the id of the logical operator it
	/// was lowered from
	pub fn add_with_id(
		&mut self,
		id: OperatorId,
		details: PhysicalDetails,
		children: &[OperatorId],
		input_schema: Schema,
		output_schema: Schema,
	) {
		for child in children {
			if let Some(child) = self.nodes.get_mut(child) {
				child.parents.push(id);
			}
		}
		self.next_id = self.next_id.max(id.0 + 1);
		self.nodes.insert(
			id,
			PhysicalOperator {
				id,
				details,
				children: children.to_vec(),
				parents: Vec::new(),
				input_schema,
				output_schema,
			},
		);
	}

	pub fn node(&self, id: OperatorId) -> Option<&PhysicalOperator> {
		self.nodes.get(&id)
	}

	pub fn nodes(&self) -> impl Iterator<Item = &PhysicalOperator> {
		self.nodes.values()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// The ids of all operators without parents (the sinks)
	pub fn roots(&self) -> Vec<OperatorId> {
		self.nodes.values().filter(|n| n.parents.is_empty()).map(|n| n.id).collect()
	}

	/// All operator ids ordered so that every child precedes its parents
	pub fn topological(&self) -> Vec<OperatorId> {
		let mut order = Vec::with_capacity(self.nodes.len());
		let mut visited = std::collections::HashSet::new();
		let mut stack: Vec<(OperatorId, bool)> =
			self.roots().into_iter().map(|id| (id, false)).collect();
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

impl fmt::Display for PhysicalPlan {
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
