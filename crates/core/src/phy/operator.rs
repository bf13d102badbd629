use crate::join::BuildSide;
use crate::join::JoinHandler;
use crate::plan::Expr;
use crate::plan::OperatorId;
use crate::plan::OriginId;
use crate::plan::ProjectField;
use crate::plan::SinkDescriptor;
use crate::plan::SourceDescriptor;
use crate::plan::UdfDescriptor;
use crate::plan::WatermarkStrategy;
use crate::sch::Schema;
use crate::win::GlobalWindowHandler;
use crate::win::KeyedWindowHandler;
use crate::win::ThresholdWindowHandler;
use std::fmt;
use std::sync::Arc;

/// A shared reference to the state handler of a windowed aggregation,
/// held by every physical operator of the decomposed window chain
#[derive(Clone)]
pub enum WindowHandlerRef {
	Keyed(Arc<KeyedWindowHandler>),
	Global(Arc<GlobalWindowHandler>),
}

impl WindowHandlerRef {
	pub fn is_keyed(&self) -> bool {
		matches!(self, WindowHandlerRef::Keyed(_))
	}
}

/// The shared state handler attached to a physical operator
#[derive(Clone)]
pub enum OperatorHandler {
	Window(WindowHandlerRef),
	Threshold(Arc<ThresholdWindowHandler>),
	Join(Arc<JoinHandler>),
}

/// The operator-specific payload of a physical plan node
#[non_exhaustive]
pub enum PhysicalDetails {
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
	Project {
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
	/// Merges several input edges into one stream
	Multiplex,
	/// Splits one stream towards several parents
	Demultiplex,
	WatermarkAssignment {
		strategy: WatermarkStrategy,
	},
	/// Thread-local slice pre-aggregation of a windowed aggregation
	SlicePreAggregation {
		handler: WindowHandlerRef,
	},
	/// Merges staged slices from all workers into the global slice store
	SliceMerging {
		handler: WindowHandlerRef,
	},
	/// Emits tumbling windows from merged slices
	WindowSink {
		handler: WindowHandlerRef,
	},
	/// Emits sliding windows from the global slice store
	SlidingWindowSink {
		handler: WindowHandlerRef,
	},
	ThresholdWindow {
		handler: Arc<ThresholdWindowHandler>,
	},
	JoinBuild {
		side: BuildSide,
		handler: Arc<JoinHandler>,
	},
	JoinSink {
		handler: Arc<JoinHandler>,
	},
	IterationCep {
		min: u64,
		max: u64,
	},
}

impl PhysicalDetails {
	/// A short name for diagnostics
	pub fn name(&self) -> &'static str {
		match self {
			PhysicalDetails::Source { .. } => "PhysicalSource",
			PhysicalDetails::Sink { .. } => "PhysicalSink",
			PhysicalDetails::Filter { .. } => "PhysicalFilter",
			PhysicalDetails::Project { .. } => "PhysicalProject",
			PhysicalDetails::Map { .. } => "PhysicalMap",
			PhysicalDetails::MapUdf { .. } => "PhysicalMapUdf",
			PhysicalDetails::FlatMapUdf { .. } => "PhysicalFlatMapUdf",
			PhysicalDetails::Multiplex => "PhysicalMultiplex",
			PhysicalDetails::Demultiplex => "PhysicalDemultiplex",
			PhysicalDetails::WatermarkAssignment { .. } => "PhysicalWatermarkAssignment",
			PhysicalDetails::SlicePreAggregation { .. } => "PhysicalSlicePreAggregation",
			PhysicalDetails::SliceMerging { .. } => "PhysicalSliceMerging",
			PhysicalDetails::WindowSink { .. } => "PhysicalWindowSink",
			PhysicalDetails::SlidingWindowSink { .. } => "PhysicalSlidingWindowSink",
			PhysicalDetails::ThresholdWindow { .. } => "PhysicalThresholdWindow",
			PhysicalDetails::JoinBuild { .. } => "PhysicalJoinBuild",
			PhysicalDetails::JoinSink { .. } => "PhysicalJoinSink",
			PhysicalDetails::IterationCep { .. } => "PhysicalIterationCep",
		}
	}

	/// The shared handler this operator holds, if any
	pub fn handler(&self) -> Option<OperatorHandler> {
		match self {
			PhysicalDetails::SlicePreAggregation {
				handler,
			}
			| PhysicalDetails::SliceMerging {
				handler,
			}
			| PhysicalDetails::WindowSink {
				handler,
			}
			| PhysicalDetails::SlidingWindowSink {
				handler,
			} => Some(OperatorHandler::Window(handler.clone())),
			PhysicalDetails::ThresholdWindow {
				handler,
			} => Some(OperatorHandler::Threshold(Arc::clone(handler))),
			PhysicalDetails::JoinBuild {
				handler,
				..
			}
			| PhysicalDetails::JoinSink {
				handler,
			} => Some(OperatorHandler::Join(Arc::clone(handler))),
			_ => None,
		}
	}
}

/// A node of the physical execution plan
pub struct PhysicalOperator {
	pub id: OperatorId,
	pub details: PhysicalDetails,
	pub children: Vec<OperatorId>,
	pub parents: Vec<OperatorId>,
	pub input_schema: Schema,
	pub output_schema: Schema,
}

impl fmt::Display for PhysicalOperator {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}({})", self.details.name(), self.id)
	}
}
