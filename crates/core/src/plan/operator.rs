use crate::plan::Expr;
use crate::plan::OperatorId;
use crate::plan::OriginId;
use crate::plan::SinkDescriptor;
use crate::plan::SourceDescriptor;
use crate::plan::UdfDescriptor;
use crate::plan::WindowDefinition;
use crate::plan::WindowType;
use crate::sch::Schema;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How watermarks are derived for a stream
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WatermarkStrategy {
	EventTime {
		on_field: String,
		multiplier: u64,
	},
	IngestionTime,
}

/// Whether a join keeps only matching pairs or every pair
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JoinType {
	Inner,
	Cartesian,
}

/// The definition of a windowed stream join
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinDefinition {
	/// The join predicate; an equality of two field accesses for an inner
	/// join, or a constant `true` for a cartesian join
	pub function: Expr,
	pub window_type: WindowType,
	pub join_type: JoinType,
	pub start_field: String,
	pub end_field: String,
	/// The origin id stamped on joined output records
	pub output_origin: OriginId,
	/// The event-time attribute of the left input
	pub left_time_field: String,
	/// The event-time attribute of the right input
	pub right_time_field: String,
}

impl JoinDefinition {
	/// The left and right key field names for an inner join
	pub fn keys(&self) -> Option<(&str, &str)> {
		self.function.as_field_equality()
	}
}

/// The successive decomposition stages of a window operator.
///
/// A freshly parsed plan carries a `Complete` window; distributed planning
/// may split it into slice creation, slice merging and window computation
/// markers placed on different nodes.
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WindowStage {
	Complete,
	SliceCreation,
	SliceMerging,
	WindowComputation,
}

impl Default for WindowStage {
	fn default() -> Self {
		WindowStage::Complete
	}
}

/// One output column of an inference model
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelField {
	pub name: String,
	pub kind: crate::sch::Kind,
}

/// One projected column, optionally renamed
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectField {
	pub expr: Expr,
	pub alias: Option<String>,
}

impl ProjectField {
	pub fn plain(expr: Expr) -> Self {
		ProjectField {
			expr,
			alias: None,
		}
	}

	pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
		ProjectField {
			expr,
			alias: Some(alias.into()),
		}
	}
}

/// The operator-specific payload of a logical plan node
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LogicalDetails {
	Source {
		descriptor: SourceDescriptor,
		origin: OriginId,
	},
	Sink {
		descriptor: SinkDescriptor,
	},
	Filter {
		predicate: Expr,
	},
	Projection {
		fields: Vec<ProjectField>,
	},
	Map {
		field: String,
		expr: Expr,
	},
	MapUdf {
		descriptor: UdfDescriptor,
	},
	FlatMapUdf {
		descriptor: UdfDescriptor,
	},
	Union,
	Window {
		definition: WindowDefinition,
		stage: WindowStage,
	},
	Join {
		definition: JoinDefinition,
	},
	Watermark {
		strategy: WatermarkStrategy,
	},
	Iteration {
		min: u64,
		max: u64,
	},
	InferModel {
		model: Vec<u8>,
		file_name: String,
		input_fields: Vec<String>,
		output_fields: Vec<ModelField>,
	},
}

impl LogicalDetails {
	/// Whether this operator consumes two independent inputs
	pub fn is_binary(&self) -> bool {
		matches!(self, LogicalDetails::Union | LogicalDetails::Join { .. })
	}

	/// A short name for diagnostics
	pub fn name(&self) -> &'static str {
		match self {
			LogicalDetails::Source { .. } => "Source",
			LogicalDetails::Sink { .. } => "Sink",
			LogicalDetails::Filter { .. } => "Filter",
			LogicalDetails::Projection { .. } => "Projection",
			LogicalDetails::Map { .. } => "Map",
			LogicalDetails::MapUdf { .. } => "MapUdf",
			LogicalDetails::FlatMapUdf { .. } => "FlatMapUdf",
			LogicalDetails::Union => "Union",
			LogicalDetails::Window { .. } => "Window",
			LogicalDetails::Join { .. } => "Join",
			LogicalDetails::Watermark { .. } => "Watermark",
			LogicalDetails::Iteration { .. } => "Iteration",
			LogicalDetails::InferModel { .. } => "InferModel",
		}
	}
}

/// The inferred input schemas and origin sets of an operator
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Inputs {
	/// Not yet inferred
	#[default]
	Pending,
	Unary {
		schema: Schema,
		origins: Vec<OriginId>,
	},
	Binary {
		left: Schema,
		right: Schema,
		left_origins: Vec<OriginId>,
		right_origins: Vec<OriginId>,
	},
}

impl Inputs {
	/// The unary input schema
	pub fn schema(&self) -> Option<&Schema> {
		match self {
			Inputs::Unary {
				schema,
				..
			} => Some(schema),
			_ => None,
		}
	}

	/// The union of all input origins, in input order
	pub fn origins(&self) -> Vec<OriginId> {
		match self {
			Inputs::Pending => Vec::new(),
			Inputs::Unary {
				origins,
				..
			} => origins.clone(),
			Inputs::Binary {
				left_origins,
				right_origins,
				..
			} => {
				let mut all = left_origins.clone();
				all.extend(right_origins.iter().copied());
				all
			}
		}
	}
}

/// A node of the logical query DAG
#[derive(Clone, Debug)]
pub struct LogicalOperator {
	pub id: OperatorId,
	pub details: LogicalDetails,
	pub children: Vec<OperatorId>,
	pub parents: Vec<OperatorId>,
	pub inputs: Inputs,
	pub output_schema: Schema,
	pub output_origins: Vec<OriginId>,
	/// The number of physical input edges; set for window operators so the
	/// handler can count per-origin termination markers
	pub input_edges: u32,
}

impl LogicalOperator {
	pub(crate) fn new(id: OperatorId, details: LogicalDetails) -> Self {
		LogicalOperator {
			id,
			details,
			children: Vec::new(),
			parents: Vec::new(),
			inputs: Inputs::Pending,
			output_schema: Schema::new(),
			output_origins: Vec::new(),
			input_edges: 0,
		}
	}
}

impl fmt::Display for LogicalOperator {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}({})", self.details.name(), self.id)
	}
}
