use rillstream_core::plan;
use rillstream_core::plan::BinaryOperator;
use rillstream_core::plan::ConfigValue;
use rillstream_core::plan::Expr;
use rillstream_core::plan::LogicalDetails;
use rillstream_core::plan::OriginId;
use rillstream_core::plan::QueryPlan;
use rillstream_core::plan::SinkDescriptor;
use rillstream_core::plan::SinkType;
use rillstream_core::plan::SourceDescriptor;
use rillstream_core::plan::SourceType;
use rillstream_core::sch::Kind;
use rillstream_core::sch::Schema;
use rillstream_core::sch::Value;
use rillstream_core::wire;

/// source(car) → filter(id < 45) → map(c := value * 2) → sink(print)
fn car_plan() -> QueryPlan {
	let schema = Schema::from_fields([
		("car$id", Kind::U32),
		("car$value", Kind::U64),
		("car$ts", Kind::U64),
	])
	.unwrap();
	let mut plan = QueryPlan::new();
	let source = plan.add(
		LogicalDetails::Source {
			descriptor: SourceDescriptor::new("car", SourceType::Csv, schema)
				.with_config("path", ConfigValue::Str("/data/car.csv".to_owned()))
				.with_config("skipHeader", ConfigValue::Bool(true)),
			origin: OriginId(1),
		},
		&[],
	);
	let filter = plan.add(
		LogicalDetails::Filter {
			predicate: Expr::binary(
				Expr::field("id"),
				BinaryOperator::LessThan,
				Expr::Constant(Value::U32(45)),
			),
		},
		&[source],
	);
	let map = plan.add(
		LogicalDetails::Map {
			field: "c".to_owned(),
			expr: Expr::binary(
				Expr::field("value"),
				BinaryOperator::Mul,
				Expr::Constant(Value::U64(2)),
			),
		},
		&[filter],
	);
	plan.add(
		LogicalDetails::Sink {
			descriptor: SinkDescriptor::new(SinkType::Print),
		},
		&[map],
	);
	plan::infer(&mut plan).unwrap();
	plan
}

#[test]
fn plan_round_trip_preserves_everything_observable() {
	let plan = car_plan();
	let bytes = wire::encode_plan(&plan).unwrap();
	let decoded = wire::decode_plan(&bytes).unwrap();

	assert_eq!(decoded.len(), plan.len());
	for node in plan.nodes() {
		let twin = decoded.node(node.id).unwrap();
		// Operator ids, details, schemas and children all survive
		assert_eq!(twin.id, node.id);
		assert_eq!(twin.details, node.details);
		assert_eq!(twin.output_schema, node.output_schema);
		assert_eq!(twin.children, node.children);
		assert_eq!(twin.output_origins, node.output_origins);
	}
}

#[test]
fn decoded_plans_lower_like_the_original() {
	use rillstream_core::cnf::CompilerOptions;
	use rillstream_core::phy::PhysicalLowering;

	let plan = car_plan();
	let decoded = wire::decode_plan(&wire::encode_plan(&plan).unwrap()).unwrap();
	let lowering = PhysicalLowering::new(CompilerOptions::default());
	let original = lowering.lower(&plan).unwrap();
	let roundtripped = lowering.lower(&decoded).unwrap();
	assert_eq!(original.len(), roundtripped.len());
	let a: Vec<_> = original.nodes().map(|n| (n.id, n.details.name())).collect();
	let b: Vec<_> = roundtripped.nodes().map(|n| (n.id, n.details.name())).collect();
	assert_eq!(a, b);
}

#[test]
fn re_encoding_is_byte_identical() {
	let plan = car_plan();
	let bytes = wire::encode_plan(&plan).unwrap();
	let decoded = wire::decode_plan(&bytes).unwrap();
	assert_eq!(wire::encode_plan(&decoded).unwrap(), bytes);
}

#[test]
fn config_map_order_is_preserved() {
	let plan = car_plan();
	let decoded = wire::decode_plan(&wire::encode_plan(&plan).unwrap()).unwrap();
	let source = decoded.sources()[0];
	match &decoded.node(source).unwrap().details {
		LogicalDetails::Source {
			descriptor,
			..
		} => {
			let keys: Vec<&str> =
				descriptor.config.iter().map(|entry| entry.key.as_str()).collect();
			assert_eq!(keys, vec!["path", "skipHeader"]);
		}
		_ => panic!("expected a source"),
	}
}

#[test]
fn garbage_fails_to_decode() {
	assert!(wire::decode_plan(&[0xde, 0xad, 0xbe, 0xef]).is_err());
}
