use crate::cnf::CompilerOptions;
use crate::cnf::WindowingStrategy;
use crate::err::Error;
use crate::join::BuildSide;
use crate::join::JoinHandler;
use crate::phy::operator::PhysicalDetails;
use crate::phy::operator::WindowHandlerRef;
use crate::phy::plan::PhysicalPlan;
use crate::plan::Inputs;
use crate::plan::LogicalDetails;
use crate::plan::LogicalOperator;
use crate::plan::OperatorId;
use crate::plan::QueryPlan;
use crate::plan::WindowDefinition;
use crate::plan::WindowStage;
use crate::plan::WindowType;
use crate::sch::Schema;
use crate::win::GlobalWindowHandler;
use crate::win::KeyedWindowHandler;
use crate::win::ThresholdWindowHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// Rewrites an inferred logical plan into a physical plan.
///
/// Every logical operator is replaced by one or more physical operators;
/// multiplex and demultiplex nodes are inserted at fan-in and fan-out
/// edges, windows decompose into their pre-aggregation, merging and sink
/// stages, and joins split into two builds and a sink sharing one handler.
pub struct PhysicalLowering {
	options: CompilerOptions,
}

impl PhysicalLowering {
	pub fn new(options: CompilerOptions) -> Self {
		PhysicalLowering {
			options,
		}
	}

	pub fn lower(&self, plan: &QueryPlan) -> Result<PhysicalPlan, Error> {
		debug!("Lowering logical plan with {} operators", plan.len());
		let first_free = plan.nodes().map(|n| n.id.0 + 1).max().unwrap_or(0);
		let mut phy = PhysicalPlan::new(first_free);
		let mut mapped: HashMap<OperatorId, OperatorId> = HashMap::new();
		for id in plan.topological() {
			let node = plan
				.node(id)
				.ok_or(Error::UnknownOperator {
					id,
				})?;
			if matches!(node.inputs, Inputs::Pending) {
				return Err(Error::SchemaMismatch {
					id,
					message: "the plan was not type-inferred before lowering".to_owned(),
				});
			}
			let children: Vec<OperatorId> = node
				.children
				.iter()
				.map(|child| {
					mapped.get(child).copied().ok_or(Error::UnknownOperator {
						id: *child,
					})
				})
				.collect::<Result<_, _>>()?;
			let out = self.lower_operator(&mut phy, node, children)?;
			// An operator with multiple parents is followed by a demultiplex
			let out = if node.parents.len() > 1 {
				phy.add(
					PhysicalDetails::Demultiplex,
					&[out],
					node.output_schema.clone(),
					node.output_schema.clone(),
				)
			} else {
				out
			};
			mapped.insert(id, out);
		}
		trace!("Lowered plan:\n{phy}");
		Ok(phy)
	}

	fn lower_operator(
		&self,
		phy: &mut PhysicalPlan,
		node: &LogicalOperator,
		children: Vec<OperatorId>,
	) -> Result<OperatorId, Error> {
		match &node.details {
			LogicalDetails::Source {
				descriptor,
				origin,
			} => {
				phy.add_with_id(
					node.id,
					PhysicalDetails::Source {
						descriptor: descriptor.clone(),
						origin: *origin,
					},
					&[],
					Schema::new(),
					node.output_schema.clone(),
				);
				Ok(node.id)
			}
			LogicalDetails::Sink {
				descriptor,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::Sink {
					descriptor: descriptor.clone(),
				},
			),
			LogicalDetails::Filter {
				predicate,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::Filter {
					predicate: predicate.clone(),
				},
			),
			LogicalDetails::Projection {
				fields,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::Project {
					fields: fields.clone(),
				},
			),
			LogicalDetails::Map {
				field,
				expr,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::Map {
					field: field.clone(),
					expr: expr.clone(),
				},
			),
			LogicalDetails::MapUdf {
				descriptor,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::MapUdf {
					descriptor: descriptor.clone(),
				},
			),
			LogicalDetails::FlatMapUdf {
				descriptor,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::FlatMapUdf {
					descriptor: descriptor.clone(),
				},
			),
			LogicalDetails::InferModel {
				..
			} => Err(Error::UnknownOperator {
				id: node.id,
			}),
			LogicalDetails::Watermark {
				strategy,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::WatermarkAssignment {
					strategy: strategy.clone(),
				},
			),
			LogicalDetails::Iteration {
				min,
				max,
			} => self.lower_simple_unary(
				phy,
				node,
				children,
				PhysicalDetails::IterationCep {
					min: *min,
					max: *max,
				},
			),
			LogicalDetails::Union => {
				// A union is a pure stream merge, lowered to a multiplex
				let input = self.unary_input_schema(node)?;
				phy.add_with_id(
					node.id,
					PhysicalDetails::Multiplex,
					&children,
					input,
					node.output_schema.clone(),
				);
				Ok(node.id)
			}
			LogicalDetails::Window {
				definition,
				stage,
			} => self.lower_window(phy, node, children, definition, *stage),
			LogicalDetails::Join {
				definition,
			} => self.lower_join(phy, node, children, definition),
		}
	}

	/// Lowers a one-to-one unary operator, inserting a multiplex when the
	/// logical operator has several children
	fn lower_simple_unary(
		&self,
		phy: &mut PhysicalPlan,
		node: &LogicalOperator,
		children: Vec<OperatorId>,
		details: PhysicalDetails,
	) -> Result<OperatorId, Error> {
		let input = self.unary_input_schema(node)?;
		let children = self.fan_in(phy, children, &input);
		phy.add_with_id(node.id, details, &children, input, node.output_schema.clone());
		Ok(node.id)
	}

	/// Inserts a multiplex in front of an operator with several children
	fn fan_in(
		&self,
		phy: &mut PhysicalPlan,
		children: Vec<OperatorId>,
		schema: &Schema,
	) -> Vec<OperatorId> {
		if children.len() <= 1 {
			return children;
		}
		let mux =
			phy.add(PhysicalDetails::Multiplex, &children, schema.clone(), schema.clone());
		vec![mux]
	}

	fn unary_input_schema(&self, node: &LogicalOperator) -> Result<Schema, Error> {
		match &node.inputs {
			Inputs::Unary {
				schema,
				..
			} => Ok(schema.clone()),
			Inputs::Binary {
				left,
				..
			} => Ok(left.clone()),
			Inputs::Pending => Err(Error::SchemaMismatch {
				id: node.id,
				message: "the plan was not type-inferred before lowering".to_owned(),
			}),
		}
	}

	fn lower_window(
		&self,
		phy: &mut PhysicalPlan,
		node: &LogicalOperator,
		children: Vec<OperatorId>,
		definition: &WindowDefinition,
		stage: WindowStage,
	) -> Result<OperatorId, Error> {
		let (input, origins) = match &node.inputs {
			Inputs::Unary {
				schema,
				origins,
			} => (schema.clone(), origins.clone()),
			_ => {
				return Err(Error::SchemaMismatch {
					id: node.id,
					message: "window operators are unary".to_owned(),
				})
			}
		};
		if origins.is_empty() {
			return Err(Error::EmptyOriginSet {
				id: node.id,
			});
		}
		let children = self.fan_in(phy, children, &input);
		if let WindowType::Threshold {
			..
		} = definition.window_type
		{
			let handler =
				Arc::new(ThresholdWindowHandler::new(definition.clone(), input.clone())?);
			phy.add_with_id(
				node.id,
				PhysicalDetails::ThresholdWindow {
					handler,
				},
				&children,
				input,
				node.output_schema.clone(),
			);
			return Ok(node.id);
		}
		if self.options.windowing_strategy == WindowingStrategy::Legacy {
			// The central window operator was superseded by thread-local
			// slicing; both strategies share the decomposed runtime
			debug!("Legacy windowing requested for {}, using thread-local slicing", node.id);
		}
		let handler = self.window_handler(definition, &input, origins)?;
		let sliding = matches!(definition.window_type, WindowType::Sliding { .. });
		match stage {
			WindowStage::SliceCreation => {
				phy.add_with_id(
					node.id,
					PhysicalDetails::SlicePreAggregation {
						handler,
					},
					&children,
					input.clone(),
					input,
				);
				Ok(node.id)
			}
			WindowStage::SliceMerging => {
				phy.add_with_id(
					node.id,
					PhysicalDetails::SliceMerging {
						handler,
					},
					&children,
					input.clone(),
					input,
				);
				Ok(node.id)
			}
			WindowStage::WindowComputation => {
				let details = if sliding {
					PhysicalDetails::SlidingWindowSink {
						handler,
					}
				} else {
					PhysicalDetails::WindowSink {
						handler,
					}
				};
				phy.add_with_id(node.id, details, &children, input, node.output_schema.clone());
				Ok(node.id)
			}
			WindowStage::Complete => {
				// The full chain shares one handler between pre-aggregation,
				// merging and the window sink
				let preagg = phy.add(
					PhysicalDetails::SlicePreAggregation {
						handler: handler.clone(),
					},
					&children,
					input.clone(),
					input.clone(),
				);
				let merging = phy.add(
					PhysicalDetails::SliceMerging {
						handler: handler.clone(),
					},
					&[preagg],
					input.clone(),
					input.clone(),
				);
				let details = if sliding {
					PhysicalDetails::SlidingWindowSink {
						handler,
					}
				} else {
					PhysicalDetails::WindowSink {
						handler,
					}
				};
				phy.add_with_id(
					node.id,
					details,
					&[merging],
					input,
					node.output_schema.clone(),
				);
				Ok(node.id)
			}
		}
	}

	fn window_handler(
		&self,
		definition: &WindowDefinition,
		input: &Schema,
		origins: Vec<crate::plan::OriginId>,
	) -> Result<WindowHandlerRef, Error> {
		let workers = self.options.worker_threads.max(1);
		if definition.is_keyed() {
			Ok(WindowHandlerRef::Keyed(Arc::new(KeyedWindowHandler::new(
				definition.clone(),
				input.clone(),
				origins,
				workers,
			)?)))
		} else {
			Ok(WindowHandlerRef::Global(Arc::new(GlobalWindowHandler::new(
				definition.clone(),
				input.clone(),
				origins,
				workers,
			)?)))
		}
	}

	fn lower_join(
		&self,
		phy: &mut PhysicalPlan,
		node: &LogicalOperator,
		children: Vec<OperatorId>,
		definition: &crate::plan::JoinDefinition,
	) -> Result<OperatorId, Error> {
		let (left, right, left_origins, right_origins) = match &node.inputs {
			Inputs::Binary {
				left,
				right,
				left_origins,
				right_origins,
			} => (left.clone(), right.clone(), left_origins.clone(), right_origins.clone()),
			_ => {
				return Err(Error::SchemaMismatch {
					id: node.id,
					message: "join operators are binary".to_owned(),
				})
			}
		};
		if left_origins.is_empty() || right_origins.is_empty() {
			return Err(Error::EmptyOriginSet {
				id: node.id,
			});
		}
		if children.len() != 2 {
			return Err(Error::SchemaMismatch {
				id: node.id,
				message: format!("join has {} physical inputs, expected 2", children.len()),
			});
		}
		let handler = Arc::new(JoinHandler::new(
			definition.clone(),
			self.options.join_strategy,
			self.options.hash_join,
			left.clone(),
			right.clone(),
			left_origins,
			right_origins,
			self.options.worker_threads.max(1),
		)?);
		let left_build = phy.add(
			PhysicalDetails::JoinBuild {
				side: BuildSide::Left,
				handler: Arc::clone(&handler),
			},
			&children[0..1],
			left,
			node.output_schema.clone(),
		);
		let right_build = phy.add(
			PhysicalDetails::JoinBuild {
				side: BuildSide::Right,
				handler: Arc::clone(&handler),
			},
			&children[1..2],
			right,
			node.output_schema.clone(),
		);
		phy.add_with_id(
			node.id,
			PhysicalDetails::JoinSink {
				handler,
			},
			&[left_build, right_build],
			node.output_schema.clone(),
			node.output_schema.clone(),
		);
		Ok(node.id)
	}
}
