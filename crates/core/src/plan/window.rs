use crate::plan::Expr;
use revision::revisioned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The shape of a window over event or ingestion time
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WindowType {
	/// Non-overlapping windows where the slide equals the size
	Tumbling {
		size: u64,
	},
	/// Overlapping windows; the slide must not exceed the size
	Sliding {
		size: u64,
		slide: u64,
	},
	/// Predicate-bounded windows, open until the predicate falsifies and
	/// emitted only when at least `min_count` tuples were observed
	Threshold {
		predicate: Expr,
		min_count: u64,
	},
}

impl WindowType {
	/// The window length in time units; threshold windows are unbounded
	pub fn size(&self) -> Option<u64> {
		match self {
			WindowType::Tumbling {
				size,
			} => Some(*size),
			WindowType::Sliding {
				size,
				..
			} => Some(*size),
			WindowType::Threshold {
				..
			} => None,
		}
	}

	/// The distance between consecutive window starts
	pub fn slide(&self) -> Option<u64> {
		match self {
			WindowType::Tumbling {
				size,
			} => Some(*size),
			WindowType::Sliding {
				slide,
				..
			} => Some(*slide),
			WindowType::Threshold {
				..
			} => None,
		}
	}
}

impl fmt::Display for WindowType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			WindowType::Tumbling {
				size,
			} => write!(f, "TUMBLING({size})"),
			WindowType::Sliding {
				size,
				slide,
			} => write!(f, "SLIDING({size}, {slide})"),
			WindowType::Threshold {
				predicate,
				min_count,
			} => write!(f, "THRESHOLD({predicate}, {min_count})"),
		}
	}
}

/// Whether windows are driven by a record attribute or the arrival clock
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TimeCharacteristic {
	/// Time is read from a record attribute and scaled to milliseconds
	EventTime {
		field: String,
		multiplier: u64,
	},
	/// Time is assigned from the system clock on ingestion
	IngestionTime,
}

/// The aggregation functions supported by window cells
#[revisioned(revision = 1)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum AggregateFunction {
	Sum,
	Min,
	Max,
	Count,
	Avg,
	Median,
}

impl fmt::Display for AggregateFunction {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			AggregateFunction::Sum => write!(f, "SUM"),
			AggregateFunction::Min => write!(f, "MIN"),
			AggregateFunction::Max => write!(f, "MAX"),
			AggregateFunction::Count => write!(f, "COUNT"),
			AggregateFunction::Avg => write!(f, "AVG"),
			AggregateFunction::Median => write!(f, "MEDIAN"),
		}
	}
}

/// One aggregation column of a window
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
	pub function: AggregateFunction,
	pub on_field: String,
	pub as_field: String,
}

impl Aggregation {
	pub fn new(function: AggregateFunction, on_field: impl Into<String>, as_field: impl Into<String>) -> Self {
		Aggregation {
			function,
			on_field: on_field.into(),
			as_field: as_field.into(),
		}
	}
}

/// The complete definition of a windowed aggregation
#[revisioned(revision = 1)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowDefinition {
	pub window_type: WindowType,
	pub time: TimeCharacteristic,
	/// Group-by keys; empty for a global window
	pub keys: Vec<String>,
	pub aggregations: Vec<Aggregation>,
	pub start_field: String,
	pub end_field: String,
}

impl WindowDefinition {
	/// Whether this window groups by at least one key
	pub fn is_keyed(&self) -> bool {
		!self.keys.is_empty()
	}

	/// The length of a slice: the finest granularity at which pre-aggregated
	/// state can still be recombined into whole windows
	pub fn slice_len(&self) -> Option<u64> {
		self.window_type.slide()
	}

	/// The largest span a single window covers, used for state garbage
	/// collection below the watermark
	pub fn max_window_size(&self) -> u64 {
		self.window_type.size().unwrap_or(0)
	}
}
