use rillstream_core::buf::BufferManager;
use rillstream_core::cnf::BufferOptions;
use rillstream_core::cnf::CompilerOptions;
use rillstream_core::cnf::StreamJoinStrategy;
use rillstream_core::ctx::QueryContext;
use rillstream_core::phy::PhysicalLowering;
use rillstream_core::plan;
use rillstream_core::plan::BinaryOperator;
use rillstream_core::plan::Expr;
use rillstream_core::plan::JoinDefinition;
use rillstream_core::plan::JoinType;
use rillstream_core::plan::LogicalDetails;
use rillstream_core::plan::OperatorId;
use rillstream_core::plan::OriginId;
use rillstream_core::plan::QueryPlan;
use rillstream_core::plan::SinkDescriptor;
use rillstream_core::plan::SinkType;
use rillstream_core::plan::SourceDescriptor;
use rillstream_core::plan::SourceType;
use rillstream_core::plan::WindowType;
use rillstream_core::sch::Kind;
use rillstream_core::sch::Schema;
use rillstream_core::sch::Value;
use rillstream_core::win::StreamRecord;
use temp_dir::TempDir;

fn join_plan(join_type: JoinType) -> (QueryPlan, OperatorId) {
	let left_schema =
		Schema::from_fields([("left$userId", Kind::U32), ("left$tsL", Kind::U64)]).unwrap();
	let right_schema =
		Schema::from_fields([("right$id", Kind::U32), ("right$tsR", Kind::U64)]).unwrap();
	let mut plan = QueryPlan::new();
	let left = plan.add(
		LogicalDetails::Source {
			descriptor: SourceDescriptor::new("left", SourceType::Tcp, left_schema),
			origin: OriginId(1),
		},
		&[],
	);
	let right = plan.add(
		LogicalDetails::Source {
			descriptor: SourceDescriptor::new("right", SourceType::Tcp, right_schema),
			origin: OriginId(2),
		},
		&[],
	);
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
				join_type,
				start_field: "start".to_owned(),
				end_field: "end".to_owned(),
				output_origin: OriginId(9),
				left_time_field: "tsL".to_owned(),
				right_time_field: "tsR".to_owned(),
			},
		},
		&[left, right],
	);
	let sink = plan.add(
		LogicalDetails::Sink {
			descriptor: SinkDescriptor::new(SinkType::Print),
		},
		&[join],
	);
	plan::infer(&mut plan).unwrap();
	(plan, sink)
}

fn deploy(plan: &QueryPlan, strategy: StreamJoinStrategy, dir: &TempDir) -> QueryContext {
	let options = CompilerOptions {
		join_strategy: strategy,
		..Default::default()
	};
	let phy = PhysicalLowering::new(options.clone()).lower(plan).unwrap();
	let buffers =
		BufferManager::new(BufferOptions::sized(4096, 16).with_spill_dir(dir.path())).unwrap();
	QueryContext::deploy(phy, options, buffers).unwrap()
}

fn left_record(user: u32, ts: u64) -> StreamRecord {
	StreamRecord::new(ts, vec![Value::U32(user), Value::U64(ts)])
}

fn right_record(id: u32, ts: u64) -> StreamRecord {
	StreamRecord::new(ts, vec![Value::U32(id), Value::U64(ts)])
}

#[test]
fn inner_join_pairs_matching_records_inside_the_window() {
	for strategy in [
		StreamJoinStrategy::HashJoinLocal,
		StreamJoinStrategy::HashJoinGlobalLocking,
		StreamJoinStrategy::HashJoinGlobalLockFree,
		StreamJoinStrategy::NestedLoopJoin,
	] {
		let (plan, sink) = join_plan(JoinType::Inner);
		let dir = TempDir::new().unwrap();
		let query = deploy(&plan, strategy, &dir);

		query
			.process(OriginId(1), vec![left_record(7, 0), left_record(7, 2000)])
			.unwrap();
		query.process(OriginId(2), vec![right_record(7, 1000)]).unwrap();
		// The window [0, 10000) is not sealed yet on either side
		assert!(query.take_sink_output(sink).is_empty());

		query.undeploy().unwrap();
		let rows: Vec<Vec<Value>> =
			query.take_sink_output(sink).into_iter().map(|r| r.row).collect();
		assert_eq!(
			rows,
			vec![
				vec![
					Value::U64(0),
					Value::U64(10_000),
					Value::U32(7),
					Value::U64(0),
					Value::U32(7),
					Value::U64(1000),
				],
				vec![
					Value::U64(0),
					Value::U64(10_000),
					Value::U32(7),
					Value::U64(2000),
					Value::U32(7),
					Value::U64(1000),
				],
			]
		);
	}
}

#[test]
fn non_matching_keys_produce_no_output() {
	let (plan, sink) = join_plan(JoinType::Inner);
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, StreamJoinStrategy::HashJoinLocal, &dir);

	query.process(OriginId(1), vec![left_record(7, 0)]).unwrap();
	query.process(OriginId(2), vec![right_record(8, 100)]).unwrap();
	query.undeploy().unwrap();
	assert!(query.take_sink_output(sink).is_empty());
}

#[test]
fn records_in_different_windows_never_pair() {
	let (plan, sink) = join_plan(JoinType::Inner);
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, StreamJoinStrategy::HashJoinLocal, &dir);

	query.process(OriginId(1), vec![left_record(7, 500)]).unwrap();
	query.process(OriginId(2), vec![right_record(7, 15_000)]).unwrap();
	query.undeploy().unwrap();
	assert!(query.take_sink_output(sink).is_empty());
}

#[test]
fn cartesian_join_pairs_every_row() {
	let (plan, sink) = join_plan(JoinType::Cartesian);
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, StreamJoinStrategy::NestedLoopJoin, &dir);

	query
		.process(OriginId(1), vec![left_record(1, 0), left_record(2, 10)])
		.unwrap();
	query.process(OriginId(2), vec![right_record(3, 5)]).unwrap();
	query.undeploy().unwrap();
	assert_eq!(query.take_sink_output(sink).len(), 2);
}

#[test]
fn join_output_schema_unions_both_sides_under_a_compound_qualifier() {
	let (plan, _) = join_plan(JoinType::Inner);
	let join = plan
		.nodes()
		.find(|n| matches!(n.details, LogicalDetails::Join { .. }))
		.unwrap();
	let names: Vec<&str> = join.output_schema.attributes().iter().map(|a| a.name()).collect();
	assert_eq!(
		names,
		vec![
			"leftright$start",
			"leftright$end",
			"left$userId",
			"left$tsL",
			"right$id",
			"right$tsR",
		]
	);
	// The origin set of the join is the union of its input origins
	assert_eq!(join.output_origins, vec![OriginId(1), OriginId(2)]);
}
