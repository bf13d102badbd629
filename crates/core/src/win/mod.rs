//! The windowing engine: slices, slice stores and window handlers.
//!
//! Windowed aggregation runs in two stages. Worker threads pre-aggregate
//! records into per-worker [`slice::Slice`]s; watermark advances seal
//! finished slices into a staging queue, from which the merging stage
//! combines them in the global [`store::SliceStore`] and emits whole
//! windows in non-decreasing end order.

pub(crate) mod handler;
pub(crate) mod slice;
pub(crate) mod store;
pub(crate) mod threshold;
pub(crate) mod watermark;

pub use handler::GlobalWindowHandler;
pub use handler::KeyedWindowHandler;
pub use slice::AggregationCell;
pub use slice::Slice;
pub use slice::SliceData;
pub use store::SliceStore;
pub use threshold::ThresholdWindowHandler;
pub use watermark::WatermarkTracker;

use crate::sch::Value;

/// One record flowing through a pipeline at runtime
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
	/// The event or ingestion timestamp in milliseconds
	pub ts: u64,
	pub row: Vec<Value>,
}

impl StreamRecord {
	pub fn new(ts: u64, row: Vec<Value>) -> Self {
		StreamRecord {
			ts,
			row,
		}
	}
}

/// One materialized window produced by a window sink
#[derive(Clone, Debug, PartialEq)]
pub struct WindowRow {
	pub start: u64,
	pub end: u64,
	pub keys: Vec<Value>,
	pub aggs: Vec<Value>,
}

impl WindowRow {
	/// Flattens the window into an output record of the sink schema:
	/// start, end, keys, aggregates
	pub fn into_record(self) -> StreamRecord {
		let mut row = Vec::with_capacity(2 + self.keys.len() + self.aggs.len());
		row.push(Value::U64(self.start));
		row.push(Value::U64(self.end));
		row.extend(self.keys);
		row.extend(self.aggs);
		StreamRecord {
			ts: self.start,
			row,
		}
	}
}

/// The lifecycle of a shared operator handler
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerState {
	Running,
	/// A cancellation signal arrived; state flushes and terminal markers
	/// propagate per origin
	Draining,
	Terminated,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::AggregateFunction;
	use crate::plan::Aggregation;
	use crate::plan::OriginId;
	use crate::plan::TimeCharacteristic;
	use crate::plan::WindowDefinition;
	use crate::plan::WindowType;
	use crate::sch::Kind;
	use crate::sch::Schema;
	use crate::sch::Value;

	fn keyed_definition(size: u64, slide: u64) -> WindowDefinition {
		WindowDefinition {
			window_type: if size == slide {
				WindowType::Tumbling {
					size,
				}
			} else {
				WindowType::Sliding {
					size,
					slide,
				}
			},
			time: TimeCharacteristic::EventTime {
				field: "ts".to_owned(),
				multiplier: 1,
			},
			keys: vec!["key".to_owned()],
			aggregations: vec![Aggregation::new(AggregateFunction::Sum, "value", "sum")],
			start_field: "start".to_owned(),
			end_field: "end".to_owned(),
		}
	}

	fn schema() -> Schema {
		Schema::from_fields([
			("s$key", Kind::U32),
			("s$value", Kind::U64),
			("s$ts", Kind::U64),
		])
		.unwrap()
	}

	fn record(key: u32, value: u64, ts: u64) -> StreamRecord {
		StreamRecord::new(ts, vec![Value::U32(key), Value::U64(value), Value::U64(ts)])
	}

	#[test]
	fn tumbling_window_aggregates_per_key() {
		let handler = KeyedWindowHandler::new(
			keyed_definition(1000, 1000),
			schema(),
			vec![OriginId(1)],
			1,
		)
		.unwrap();
		let origin = OriginId(1);
		for (key, value, ts) in [(1, 10, 0), (1, 20, 500), (2, 30, 600), (1, 40, 1500)] {
			handler.on_record(0, origin, &record(key, value, ts)).unwrap();
		}
		handler.on_watermark(origin, 2000).unwrap();
		let rows = handler.poll_windows().unwrap();
		assert_eq!(
			rows,
			vec![
				WindowRow {
					start: 0,
					end: 1000,
					keys: vec![Value::U32(1)],
					aggs: vec![Value::U64(30)],
				},
				WindowRow {
					start: 0,
					end: 1000,
					keys: vec![Value::U32(2)],
					aggs: vec![Value::U64(30)],
				},
				WindowRow {
					start: 1000,
					end: 2000,
					keys: vec![Value::U32(1)],
					aggs: vec![Value::U64(40)],
				},
			]
		);
	}

	#[test]
	fn sliding_windows_cover_each_record_size_over_slide_times() {
		let mut definition = keyed_definition(2000, 1000);
		definition.keys.clear();
		let handler =
			GlobalWindowHandler::new(definition, schema(), vec![OriginId(1)], 1).unwrap();
		let origin = OriginId(1);
		handler.on_record(0, origin, &record(1, 5, 1500)).unwrap();
		handler.drain().unwrap();
		let rows = handler.poll_windows().unwrap();
		// One record, size/slide = 2 windows: [0, 2000) and [1000, 3000)
		let covering: Vec<(u64, u64)> = rows.iter().map(|r| (r.start, r.end)).collect();
		assert_eq!(covering, vec![(0, 2000), (1000, 3000)]);
	}

	#[test]
	fn watermark_only_advances_when_all_origins_reported() {
		let handler = KeyedWindowHandler::new(
			keyed_definition(1000, 1000),
			schema(),
			vec![OriginId(1), OriginId(2)],
			1,
		)
		.unwrap();
		handler.on_record(0, OriginId(1), &record(1, 10, 100)).unwrap();
		handler.on_watermark(OriginId(1), 5000).unwrap();
		assert!(handler.poll_windows().unwrap().is_empty());
		handler.on_watermark(OriginId(2), 5000).unwrap();
		assert_eq!(handler.poll_windows().unwrap().len(), 1);
	}

	#[test]
	fn merged_workers_produce_one_window() {
		let handler = KeyedWindowHandler::new(
			keyed_definition(1000, 1000),
			schema(),
			vec![OriginId(1)],
			4,
		)
		.unwrap();
		let origin = OriginId(1);
		for worker in 0..4 {
			handler.on_record(worker, origin, &record(1, 10, 100)).unwrap();
		}
		handler.on_watermark(origin, 1000).unwrap();
		let rows = handler.poll_windows().unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].aggs, vec![Value::U64(40)]);
	}

	#[test]
	fn drain_flushes_open_slices() {
		let handler = KeyedWindowHandler::new(
			keyed_definition(1000, 1000),
			schema(),
			vec![OriginId(1)],
			1,
		)
		.unwrap();
		handler.on_record(0, OriginId(1), &record(1, 10, 100)).unwrap();
		handler.drain().unwrap();
		let rows = handler.poll_windows().unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(handler.state(), HandlerState::Terminated);
	}
}
