//! Physical lowering: the logical→physical plan rewrite.
//!
//! Lowering replaces each logical node with its physical counterpart,
//! inserting multiplex nodes at fan-in edges, demultiplex nodes at fan-out
//! edges, decomposing time windows into a pre-aggregation, merging and
//! sink chain, and wiring join builds and the join sink to one shared
//! handler. Strategy selection comes from [`crate::cnf::CompilerOptions`].

pub(crate) mod lower;
pub(crate) mod operator;
pub(crate) mod plan;

pub use lower::PhysicalLowering;
pub use operator::OperatorHandler;
pub use operator::PhysicalDetails;
pub use operator::PhysicalOperator;
pub use operator::WindowHandlerRef;
pub use plan::PhysicalPlan;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cnf::CompilerOptions;
	use crate::plan;
	use crate::plan::AggregateFunction;
	use crate::plan::Aggregation;
	use crate::plan::BinaryOperator;
	use crate::plan::Expr;
	use crate::plan::JoinDefinition;
	use crate::plan::JoinType;
	use crate::plan::LogicalDetails;
	use crate::plan::OperatorId;
	use crate::plan::OriginId;
	use crate::plan::QueryPlan;
	use crate::plan::SinkDescriptor;
	use crate::plan::SinkType;
	use crate::plan::SourceDescriptor;
	use crate::plan::SourceType;
	use crate::plan::TimeCharacteristic;
	use crate::plan::WindowDefinition;
	use crate::plan::WindowStage;
	use crate::plan::WindowType;
	use crate::sch::Kind;
	use crate::sch::Schema;
	use crate::sch::Value;

	fn source(plan: &mut QueryPlan, name: &str, origin: u64, fields: &[(&str, Kind)]) -> OperatorId {
		let schema =
			Schema::from_fields(fields.iter().map(|(n, k)| (n.to_string(), *k))).unwrap();
		plan.add(
			LogicalDetails::Source {
				descriptor: SourceDescriptor::new(name, SourceType::Csv, schema),
				origin: OriginId(origin),
			},
			&[],
		)
	}

	fn lowered(plan: &mut QueryPlan) -> PhysicalPlan {
		plan::infer(plan).unwrap();
		PhysicalLowering::new(CompilerOptions::default()).lower(plan).unwrap()
	}

	#[test]
	fn lowers_a_linear_pipeline_one_to_one() {
		let mut plan = QueryPlan::new();
		let src = source(&mut plan, "cars", 1, &[("id", Kind::U32)]);
		let filter = plan.add(
			LogicalDetails::Filter {
				predicate: Expr::binary(
					Expr::field("id"),
					BinaryOperator::LessThan,
					Expr::Constant(Value::U32(45)),
				),
			},
			&[src],
		);
		let sink = plan.add(
			LogicalDetails::Sink {
				descriptor: SinkDescriptor::new(SinkType::Print),
			},
			&[filter],
		);
		let phy = lowered(&mut plan);
		assert_eq!(phy.len(), 3);
		assert!(matches!(phy.node(src).unwrap().details, PhysicalDetails::Source { .. }));
		assert!(matches!(phy.node(filter).unwrap().details, PhysicalDetails::Filter { .. }));
		assert!(matches!(phy.node(sink).unwrap().details, PhysicalDetails::Sink { .. }));
	}

	#[test]
	fn union_lowers_to_a_multiplex() {
		let mut plan = QueryPlan::new();
		let a = source(&mut plan, "a", 1, &[("v", Kind::U64)]);
		let b = source(&mut plan, "b", 2, &[("v", Kind::U64)]);
		let union = plan.add(LogicalDetails::Union, &[a, b]);
		plan.add(
			LogicalDetails::Sink {
				descriptor: SinkDescriptor::new(SinkType::Print),
			},
			&[union],
		);
		let phy = lowered(&mut plan);
		assert!(matches!(phy.node(union).unwrap().details, PhysicalDetails::Multiplex));
		assert_eq!(phy.node(union).unwrap().children.len(), 2);
	}

	#[test]
	fn fan_out_inserts_a_demultiplex() {
		let mut plan = QueryPlan::new();
		let src = source(&mut plan, "cars", 1, &[("v", Kind::U64)]);
		for _ in 0..2 {
			plan.add(
				LogicalDetails::Sink {
					descriptor: SinkDescriptor::new(SinkType::Print),
				},
				&[src],
			);
		}
		let phy = lowered(&mut plan);
		let demux: Vec<_> = phy
			.nodes()
			.filter(|n| matches!(n.details, PhysicalDetails::Demultiplex))
			.collect();
		assert_eq!(demux.len(), 1);
		assert_eq!(demux[0].parents.len(), 2);
	}

	#[test]
	fn time_window_decomposes_into_the_slicing_chain() {
		let mut plan = QueryPlan::new();
		let src = source(
			&mut plan,
			"cars",
			1,
			&[("key", Kind::U32), ("value", Kind::U64), ("ts", Kind::U64)],
		);
		let window = plan.add(
			LogicalDetails::Window {
				definition: WindowDefinition {
					window_type: WindowType::Tumbling {
						size: 1000,
					},
					time: TimeCharacteristic::EventTime {
						field: "ts".to_owned(),
						multiplier: 1,
					},
					keys: vec!["key".to_owned()],
					aggregations: vec![Aggregation::new(
						AggregateFunction::Sum,
						"value",
						"sum",
					)],
					start_field: "start".to_owned(),
					end_field: "end".to_owned(),
				},
				stage: WindowStage::Complete,
			},
			&[src],
		);
		plan.add(
			LogicalDetails::Sink {
				descriptor: SinkDescriptor::new(SinkType::Print),
			},
			&[window],
		);
		let phy = lowered(&mut plan);
		// source, preagg, merging, sink, query sink
		assert_eq!(phy.len(), 5);
		let preagg = phy
			.nodes()
			.find(|n| matches!(n.details, PhysicalDetails::SlicePreAggregation { .. }))
			.unwrap();
		let merging = phy
			.nodes()
			.find(|n| matches!(n.details, PhysicalDetails::SliceMerging { .. }))
			.unwrap();
		let wsink = phy.node(window).unwrap();
		assert!(matches!(wsink.details, PhysicalDetails::WindowSink { .. }));
		assert_eq!(merging.children, vec![preagg.id]);
		assert_eq!(wsink.children, vec![merging.id]);
	}

	#[test]
	fn sliding_window_uses_the_sliding_sink() {
		let mut plan = QueryPlan::new();
		let src = source(&mut plan, "cars", 1, &[("value", Kind::U64), ("ts", Kind::U64)]);
		let window = plan.add(
			LogicalDetails::Window {
				definition: WindowDefinition {
					window_type: WindowType::Sliding {
						size: 2000,
						slide: 1000,
					},
					time: TimeCharacteristic::EventTime {
						field: "ts".to_owned(),
						multiplier: 1,
					},
					keys: Vec::new(),
					aggregations: vec![Aggregation::new(
						AggregateFunction::Max,
						"value",
						"max",
					)],
					start_field: "start".to_owned(),
					end_field: "end".to_owned(),
				},
				stage: WindowStage::Complete,
			},
			&[src],
		);
		let phy = lowered(&mut plan);
		assert!(matches!(
			phy.node(window).unwrap().details,
			PhysicalDetails::SlidingWindowSink { .. }
		));
	}

	#[test]
	fn join_splits_into_builds_and_sink_sharing_one_handler() {
		let mut plan = QueryPlan::new();
		let left = source(&mut plan, "left", 1, &[("userId", Kind::U32), ("tsL", Kind::U64)]);
		let right = source(&mut plan, "right", 2, &[("id", Kind::U32), ("tsR", Kind::U64)]);
		let join = plan.add(
			LogicalDetails::Join {
				definition: JoinDefinition {
					function: Expr::binary(
						Expr::field("userId"),
						BinaryOperator::Equal,
						Expr::field("id"),
					),
					window_type: WindowType::Tumbling {
						size: 10_000,
					},
					join_type: JoinType::Inner,
					start_field: "start".to_owned(),
					end_field: "end".to_owned(),
					output_origin: OriginId(7),
					left_time_field: "tsL".to_owned(),
					right_time_field: "tsR".to_owned(),
				},
			},
			&[left, right],
		);
		let phy = lowered(&mut plan);
		let builds: Vec<_> = phy
			.nodes()
			.filter(|n| matches!(n.details, PhysicalDetails::JoinBuild { .. }))
			.collect();
		assert_eq!(builds.len(), 2);
		let sink = phy.node(join).unwrap();
		assert!(matches!(sink.details, PhysicalDetails::JoinSink { .. }));
		assert_eq!(sink.children.len(), 2);
		// Both builds and the sink share the same handler
		let handlers: Vec<*const crate::join::JoinHandler> = phy
			.nodes()
			.filter_map(|n| match &n.details {
				PhysicalDetails::JoinBuild {
					handler,
					..
				} => Some(std::sync::Arc::as_ptr(handler)),
				PhysicalDetails::JoinSink {
					handler,
				} => Some(std::sync::Arc::as_ptr(handler)),
				_ => None,
			})
			.collect();
		assert_eq!(handlers.len(), 3);
		assert!(handlers.windows(2).all(|pair| pair[0] == pair[1]));
	}

	#[test]
	fn stage_markers_lower_to_their_chain_suffix() {
		for (stage, expect_len) in [
			(WindowStage::SliceCreation, 2),
			(WindowStage::SliceMerging, 2),
			(WindowStage::WindowComputation, 2),
		] {
			let mut plan = QueryPlan::new();
			let src =
				source(&mut plan, "cars", 1, &[("value", Kind::U64), ("ts", Kind::U64)]);
			plan.add(
				LogicalDetails::Window {
					definition: WindowDefinition {
						window_type: WindowType::Tumbling {
							size: 1000,
						},
						time: TimeCharacteristic::EventTime {
							field: "ts".to_owned(),
							multiplier: 1,
						},
						keys: Vec::new(),
						aggregations: vec![Aggregation::new(
							AggregateFunction::Count,
							"value",
							"cnt",
						)],
						start_field: "start".to_owned(),
						end_field: "end".to_owned(),
					},
					stage,
				},
				&[src],
			);
			let phy = lowered(&mut plan);
			assert_eq!(phy.len(), expect_len);
		}
	}
}
