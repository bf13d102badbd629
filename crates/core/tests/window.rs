use rillstream_core::buf::BufferManager;
use rillstream_core::cnf::BufferOptions;
use rillstream_core::cnf::CompilerOptions;
use rillstream_core::ctx::QueryContext;
use rillstream_core::phy::PhysicalLowering;
use rillstream_core::plan;
use rillstream_core::plan::AggregateFunction;
use rillstream_core::plan::Aggregation;
use rillstream_core::plan::LogicalDetails;
use rillstream_core::plan::OperatorId;
use rillstream_core::plan::OriginId;
use rillstream_core::plan::QueryPlan;
use rillstream_core::plan::SinkDescriptor;
use rillstream_core::plan::SinkType;
use rillstream_core::plan::SourceDescriptor;
use rillstream_core::plan::SourceType;
use rillstream_core::plan::TimeCharacteristic;
use rillstream_core::plan::WatermarkStrategy;
use rillstream_core::plan::WindowDefinition;
use rillstream_core::plan::WindowStage;
use rillstream_core::plan::WindowType;
use rillstream_core::sch::Kind;
use rillstream_core::sch::Schema;
use rillstream_core::sch::Value;
use rillstream_core::win::StreamRecord;
use temp_dir::TempDir;
use test_log::test;

fn keyed_window_plan(window_type: WindowType) -> (QueryPlan, OperatorId) {
	let schema = Schema::from_fields([
		("cars$key", Kind::U32),
		("cars$value", Kind::U64),
		("cars$ts", Kind::U64),
	])
	.unwrap();
	let mut plan = QueryPlan::new();
	let source = plan.add(
		LogicalDetails::Source {
			descriptor: SourceDescriptor::new("cars", SourceType::Csv, schema),
			origin: OriginId(1),
		},
		&[],
	);
	let watermark = plan.add(
		LogicalDetails::Watermark {
			strategy: WatermarkStrategy::EventTime {
				on_field: "ts".to_owned(),
				multiplier: 1,
			},
		},
		&[source],
	);
	let window = plan.add(
		LogicalDetails::Window {
			definition: WindowDefinition {
				window_type,
				time: TimeCharacteristic::EventTime {
					field: "ts".to_owned(),
					multiplier: 1,
				},
				keys: vec!["key".to_owned()],
				aggregations: vec![Aggregation::new(AggregateFunction::Sum, "value", "sum")],
				start_field: "start".to_owned(),
				end_field: "end".to_owned(),
			},
			stage: WindowStage::Complete,
		},
		&[watermark],
	);
	let sink = plan.add(
		LogicalDetails::Sink {
			descriptor: SinkDescriptor::new(SinkType::Print),
		},
		&[window],
	);
	plan::infer(&mut plan).unwrap();
	(plan, sink)
}

fn deploy(plan: &QueryPlan, dir: &TempDir) -> QueryContext {
	let phy = PhysicalLowering::new(CompilerOptions::default()).lower(plan).unwrap();
	let buffers = BufferManager::new(
		BufferOptions::sized(4096, 16).with_spill_dir(dir.path()),
	)
	.unwrap();
	QueryContext::deploy(phy, CompilerOptions::default(), buffers).unwrap()
}

fn record(key: u32, value: u64, ts: u64) -> StreamRecord {
	StreamRecord::new(ts, vec![Value::U32(key), Value::U64(value), Value::U64(ts)])
}

#[test]
fn tumbling_window_sums_per_key() {
	let (plan, sink) = keyed_window_plan(WindowType::Tumbling {
		size: 1000,
	});
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, &dir);

	query
		.process(
			OriginId(1),
			vec![
				record(1, 10, 0),
				record(1, 20, 500),
				record(2, 30, 600),
				record(1, 40, 1500),
			],
		)
		.unwrap();
	// The watermark reached 1500, so the first window is complete
	let rows: Vec<Vec<Value>> =
		query.take_sink_output(sink).into_iter().map(|r| r.row).collect();
	assert_eq!(
		rows,
		vec![
			vec![Value::U64(0), Value::U64(1000), Value::U32(1), Value::U64(30)],
			vec![Value::U64(0), Value::U64(1000), Value::U32(2), Value::U64(30)],
		]
	);

	// Undeploying drains the open slice and emits the second window
	query.undeploy().unwrap();
	let rows: Vec<Vec<Value>> =
		query.take_sink_output(sink).into_iter().map(|r| r.row).collect();
	assert_eq!(
		rows,
		vec![vec![Value::U64(1000), Value::U64(2000), Value::U32(1), Value::U64(40)]]
	);
}

#[test]
fn every_record_joins_exactly_one_tumbling_window() {
	let (plan, sink) = keyed_window_plan(WindowType::Tumbling {
		size: 1000,
	});
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, &dir);

	let mut batch = Vec::new();
	for ts in (0..5000).step_by(250) {
		batch.push(record(1, 1, ts));
	}
	query.process(OriginId(1), batch).unwrap();
	query.undeploy().unwrap();

	let rows = query.take_sink_output(sink);
	// 20 records, four per window, five windows
	assert_eq!(rows.len(), 5);
	let total: u64 = rows
		.iter()
		.map(|r| match r.row[3] {
			Value::U64(v) => v,
			_ => 0,
		})
		.sum();
	assert_eq!(total, 20);
	// Windows arrive in non-decreasing end order
	let ends: Vec<u64> = rows
		.iter()
		.map(|r| match r.row[1] {
			Value::U64(v) => v,
			_ => 0,
		})
		.collect();
	assert!(ends.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn sliding_windows_count_each_record_size_over_slide_times() {
	let (plan, sink) = keyed_window_plan(WindowType::Sliding {
		size: 2000,
		slide: 1000,
	});
	let dir = TempDir::new().unwrap();
	let query = deploy(&plan, &dir);

	query.process(OriginId(1), vec![record(1, 1, 1500)]).unwrap();
	query.undeploy().unwrap();

	let rows = query.take_sink_output(sink);
	// One record contributes to exactly size / slide = 2 windows
	assert_eq!(rows.len(), 2);
	let bounds: Vec<(u64, u64)> = rows
		.iter()
		.map(|r| match (&r.row[0], &r.row[1]) {
			(Value::U64(s), Value::U64(e)) => (*s, *e),
			_ => (0, 0),
		})
		.collect();
	assert_eq!(bounds, vec![(0, 2000), (1000, 3000)]);
}

#[test]
fn window_outputs_carry_the_qualified_schema() {
	let (plan, _) = keyed_window_plan(WindowType::Tumbling {
		size: 1000,
	});
	let window = plan
		.nodes()
		.find(|n| matches!(n.details, LogicalDetails::Window { .. }))
		.unwrap();
	let names: Vec<&str> =
		window.output_schema.attributes().iter().map(|a| a.name()).collect();
	assert_eq!(names, vec!["cars$start", "cars$end", "cars$key", "cars$sum"]);
}
