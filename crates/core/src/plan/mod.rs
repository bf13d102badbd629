//! Logical query plans.
//!
//! A logical plan is a DAG of relational and streaming operators produced by
//! the query front-end. The [`infer`] phase derives output schemas and origin
//! sets bottom-up before the plan is lowered to a physical pipeline.

pub(crate) mod descriptor;
pub(crate) mod expr;
pub(crate) mod infer;
pub(crate) mod operator;
pub(crate) mod query;
pub(crate) mod window;

pub use descriptor::ConfigEntry;
pub use descriptor::ConfigValue;
pub use descriptor::ParserConfig;
pub use descriptor::SinkDescriptor;
pub use descriptor::SinkType;
pub use descriptor::SourceDescriptor;
pub use descriptor::SourceType;
pub use descriptor::UdfDescriptor;
pub use expr::BinaryOperator;
pub use expr::Expr;
pub use expr::UnaryOperator;
pub use infer::infer;
pub use operator::Inputs;
pub use operator::JoinDefinition;
pub use operator::JoinType;
pub use operator::LogicalDetails;
pub use operator::LogicalOperator;
pub use operator::ModelField;
pub use operator::ProjectField;
pub use operator::WatermarkStrategy;
pub use operator::WindowStage;
pub use query::QueryPlan;
pub use window::AggregateFunction;
pub use window::Aggregation;
pub use window::TimeCharacteristic;
pub use window::WindowDefinition;
pub use window::WindowType;

use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The immutable identity of an operator within a query plan
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub u64);

impl fmt::Display for OperatorId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "op{}", self.0)
	}
}

/// The identity of a record producer with a monotonic per-origin timestamp
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct OriginId(pub u64);

impl fmt::Display for OriginId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "origin{}", self.0)
	}
}
