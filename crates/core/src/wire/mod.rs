//! The bit-stable wire format for exchanging compiled subplans.
//!
//! Operators serialize through versioned binary records carrying the
//! operator id, the typed details payload, input and output schemas, the
//! child id list and the per-side origin id lists. Config maps are stored
//! as ordered pairs, so re-encoding a decoded operator yields byte
//! identical output.

use crate::err::Error;
use crate::plan::Inputs;
use crate::plan::LogicalDetails;
use crate::plan::LogicalOperator;
use crate::plan::OperatorId;
use crate::plan::OriginId;
use crate::plan::QueryPlan;
use crate::sch::Schema;
use revision::revisioned;
use revision::Revisioned;
use serde::{Deserialize, Serialize};

/// The serialized input side of an operator
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WireInputs {
	None,
	Unary {
		schema: Schema,
		origins: Vec<OriginId>,
	},
	Binary {
		left: Schema,
		right: Schema,
		left_origins: Vec<OriginId>,
		right_origins: Vec<OriginId>,
		/// The physical input edge counts of each side
		left_edges: u32,
		right_edges: u32,
	},
}

/// One serialized operator of a subplan
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireOperator {
	pub id: OperatorId,
	pub details: LogicalDetails,
	pub inputs: WireInputs,
	pub output_schema: Schema,
	pub output_origins: Vec<OriginId>,
	pub children: Vec<OperatorId>,
	/// The number of physical input edges of a window operator
	pub input_edges: u32,
}

/// A serialized subplan: its operators in id order
#[revisioned(revision = 1)]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePlan {
	pub operators: Vec<WireOperator>,
}

/// Converts one logical operator into its wire form
pub fn serialize_operator(node: &LogicalOperator) -> WireOperator {
	trace!("Serializing operator {node}");
	let inputs = match &node.inputs {
		Inputs::Pending => WireInputs::None,
		Inputs::Unary {
			schema,
			origins,
		} => WireInputs::Unary {
			schema: schema.clone(),
			origins: origins.clone(),
		},
		Inputs::Binary {
			left,
			right,
			left_origins,
			right_origins,
		} => WireInputs::Binary {
			left: left.clone(),
			right: right.clone(),
			left_origins: left_origins.clone(),
			right_origins: right_origins.clone(),
			left_edges: left_origins.len() as u32,
			right_edges: right_origins.len() as u32,
		},
	};
	WireOperator {
		id: node.id,
		details: node.details.clone(),
		inputs,
		output_schema: node.output_schema.clone(),
		output_origins: node.output_origins.clone(),
		children: node.children.clone(),
		input_edges: node.input_edges,
	}
}

/// Reconstructs a logical operator from its wire form
pub fn deserialize_operator(wire: WireOperator) -> LogicalOperator {
	let inputs = match wire.inputs {
		WireInputs::None => Inputs::Pending,
		WireInputs::Unary {
			schema,
			origins,
		} => Inputs::Unary {
			schema,
			origins,
		},
		WireInputs::Binary {
			left,
			right,
			left_origins,
			right_origins,
			..
		} => Inputs::Binary {
			left,
			right,
			left_origins,
			right_origins,
		},
	};
	LogicalOperator {
		id: wire.id,
		details: wire.details,
		children: wire.children,
		parents: Vec::new(),
		inputs,
		output_schema: wire.output_schema,
		output_origins: wire.output_origins,
		input_edges: wire.input_edges,
	}
}

/// Encodes one operator into its bit-stable binary form
pub fn encode_operator(node: &LogicalOperator) -> Result<Vec<u8>, Error> {
	let wire = serialize_operator(node);
	encode_wire(&wire)
}

/// Decodes one operator from its binary form
pub fn decode_operator(mut bytes: &[u8]) -> Result<LogicalOperator, Error> {
	let wire = WireOperator::deserialize_revisioned(&mut bytes).map_err(|error| {
		Error::CannotDeserialize {
			message: error.to_string(),
		}
	})?;
	Ok(deserialize_operator(wire))
}

/// Encodes a whole subplan, operators in id order
pub fn encode_plan(plan: &QueryPlan) -> Result<Vec<u8>, Error> {
	let wire = WirePlan {
		operators: plan.nodes().map(serialize_operator).collect(),
	};
	let mut out = Vec::new();
	wire.serialize_revisioned(&mut out).map_err(|error| cannot_serialize(&wire, error))?;
	Ok(out)
}

/// Decodes a subplan, rebuilding the operator arena with its original ids
pub fn decode_plan(mut bytes: &[u8]) -> Result<QueryPlan, Error> {
	let wire = WirePlan::deserialize_revisioned(&mut bytes).map_err(|error| {
		Error::CannotDeserialize {
			message: error.to_string(),
		}
	})?;
	let mut plan = QueryPlan::new();
	for operator in wire.operators {
		let node = deserialize_operator(operator);
		let id = node.id;
		let children = node.children.clone();
		plan.add_with_id(id, node.details.clone(), &children);
		let rebuilt =
			plan.node_mut(id).expect("unreachable: operator was just inserted");
		rebuilt.inputs = node.inputs;
		rebuilt.output_schema = node.output_schema;
		rebuilt.output_origins = node.output_origins;
		rebuilt.input_edges = node.input_edges;
	}
	Ok(plan)
}

fn encode_wire(wire: &WireOperator) -> Result<Vec<u8>, Error> {
	let mut out = Vec::new();
	wire.serialize_revisioned(&mut out).map_err(|error| cannot_serialize(wire, error))?;
	Ok(out)
}

/// Builds the serialization failure, attaching a JSON dump of the payload
/// when it is representable
fn cannot_serialize<T: Serialize>(payload: &T, error: revision::Error) -> Error {
	let dump = serde_json::to_string(payload).unwrap_or_else(|_| "<unrepresentable>".to_owned());
	Error::CannotSerialize {
		message: format!("{error:?}; payload {dump}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan;
	use crate::plan::BinaryOperator;
	use crate::plan::ConfigValue;
	use crate::plan::Expr;
	use crate::plan::SinkDescriptor;
	use crate::plan::SinkType;
	use crate::plan::SourceDescriptor;
	use crate::plan::SourceType;
	use crate::plan::WatermarkStrategy;
	use crate::sch::Kind;
	use crate::sch::Value;

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
					.with_config("host", ConfigValue::Str("127.0.0.1".to_owned()))
					.with_config("port", ConfigValue::U32(9000)),
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
	fn plan_round_trip_preserves_ids_schemas_and_details() {
		let plan = car_plan();
		let bytes = encode_plan(&plan).unwrap();
		let decoded = decode_plan(&bytes).unwrap();
		assert_eq!(decoded.len(), plan.len());
		for node in plan.nodes() {
			let twin = decoded.node(node.id).unwrap();
			assert_eq!(twin.details, node.details);
			assert_eq!(twin.output_schema, node.output_schema);
			assert_eq!(twin.output_origins, node.output_origins);
			assert_eq!(twin.children, node.children);
		}
	}

	#[test]
	fn re_encoding_a_decoded_plan_is_byte_identical() {
		let plan = car_plan();
		let bytes = encode_plan(&plan).unwrap();
		let decoded = decode_plan(&bytes).unwrap();
		let again = encode_plan(&decoded).unwrap();
		assert_eq!(bytes, again);
	}

	#[test]
	fn operator_round_trip_keeps_origin_ordering() {
		let mut plan = QueryPlan::new();
		let schema = Schema::from_fields([("s$v", Kind::U64)]).unwrap();
		let a = plan.add(
			LogicalDetails::Source {
				descriptor: SourceDescriptor::new("s", SourceType::Tcp, schema.clone()),
				origin: OriginId(9),
			},
			&[],
		);
		let b = plan.add(
			LogicalDetails::Source {
				descriptor: SourceDescriptor::new("s2", SourceType::Tcp, schema),
				origin: OriginId(3),
			},
			&[],
		);
		let union = plan.add(LogicalDetails::Union, &[a, b]);
		plan::infer(&mut plan).unwrap();
		let node = plan.node(union).unwrap();
		let decoded = decode_operator(&encode_operator(node).unwrap()).unwrap();
		match decoded.inputs {
			Inputs::Binary {
				left_origins,
				right_origins,
				..
			} => {
				assert_eq!(left_origins, vec![OriginId(9)]);
				assert_eq!(right_origins, vec![OriginId(3)]);
			}
			_ => panic!("expected binary inputs"),
		}
		assert_eq!(decoded.output_origins, vec![OriginId(9), OriginId(3)]);
	}

	#[test]
	fn watermark_strategy_round_trips() {
		let mut plan = QueryPlan::new();
		let schema = Schema::from_fields([("s$ts", Kind::U64)]).unwrap();
		let src = plan.add(
			LogicalDetails::Source {
				descriptor: SourceDescriptor::new("s", SourceType::Mqtt, schema),
				origin: OriginId(1),
			},
			&[],
		);
		let wm = plan.add(
			LogicalDetails::Watermark {
				strategy: WatermarkStrategy::EventTime {
					on_field: "ts".to_owned(),
					multiplier: 1000,
				},
			},
			&[src],
		);
		plan::infer(&mut plan).unwrap();
		let decoded = decode_operator(&encode_operator(plan.node(wm).unwrap()).unwrap()).unwrap();
		assert_eq!(
			decoded.details,
			LogicalDetails::Watermark {
				strategy: WatermarkStrategy::EventTime {
					on_field: "ts".to_owned(),
					multiplier: 1000,
				},
			}
		);
	}

	#[test]
	fn truncated_payloads_fail_to_decode() {
		let plan = car_plan();
		let bytes = encode_plan(&plan).unwrap();
		assert!(matches!(
			decode_plan(&bytes[..bytes.len() / 2]),
			Err(Error::CannotDeserialize { .. })
		));
	}
}
