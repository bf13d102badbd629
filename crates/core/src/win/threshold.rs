use crate::err::Error;
use crate::plan::Expr;
use crate::plan::OriginId;
use crate::plan::WindowDefinition;
use crate::plan::WindowType;
use crate::sch::Schema;
use crate::win::slice::AggregationCell;
use crate::win::StreamRecord;
use crate::win::WindowRow;
use ahash::AHashMap;
use std::sync::Mutex;

struct OpenWindow {
	start: u64,
	last: u64,
	count: u64,
	cell: AggregationCell,
}

/// A predicate-bounded window, open while the predicate holds.
///
/// The window closes when the predicate falsifies and is emitted only when
/// at least the configured minimum number of tuples was observed.
pub struct ThresholdWindowHandler {
	definition: WindowDefinition,
	schema: Schema,
	predicate: Expr,
	min_count: u64,
	agg_inputs: Vec<usize>,
	open: Mutex<AHashMap<OriginId, OpenWindow>>,
}

impl ThresholdWindowHandler {
	pub fn new(definition: WindowDefinition, schema: Schema) -> Result<Self, Error> {
		let (predicate, min_count) = match &definition.window_type {
			WindowType::Threshold {
				predicate,
				min_count,
			} => (predicate.clone(), *min_count),
			_ => {
				return Err(Error::InvalidWindow {
					id: Default::default(),
					message: "threshold handler requires a threshold window".to_owned(),
				})
			}
		};
		let agg_inputs = definition
			.aggregations
			.iter()
			.map(|aggregation| schema.resolve(&aggregation.on_field))
			.collect::<Result<Vec<_>, _>>()?;
		Ok(ThresholdWindowHandler {
			definition,
			schema,
			predicate,
			min_count,
			agg_inputs,
			open: Mutex::new(AHashMap::new()),
		})
	}

	/// Feeds one record; returns a closed window when the predicate
	/// falsified
	pub fn on_record(
		&self,
		origin: OriginId,
		record: &StreamRecord,
	) -> Result<Option<WindowRow>, Error> {
		let truthy = self.predicate.compute(&self.schema, &record.row)?.is_truthy();
		let mut open = self.open.lock().expect("unreachable: threshold state poisoned");
		if truthy {
			match open.get_mut(&origin) {
				Some(window) => {
					window.last = record.ts;
					window.count += 1;
					window.cell.update(&self.agg_inputs, &record.row)?;
				}
				None => {
					let mut cell =
						AggregationCell::new(&self.definition.aggregations, &self.schema)?;
					cell.update(&self.agg_inputs, &record.row)?;
					open.insert(
						origin,
						OpenWindow {
							start: record.ts,
							last: record.ts,
							count: 1,
							cell,
						},
					);
				}
			}
			return Ok(None);
		}
		Ok(open.remove(&origin).and_then(|window| self.close(window, record.ts)))
	}

	/// Closes every open window, as done on drain
	pub fn flush(&self) -> Vec<WindowRow> {
		let mut open = self.open.lock().expect("unreachable: threshold state poisoned");
		let mut rows: Vec<WindowRow> = open
			.drain()
			.filter_map(|(_, window)| {
				let end = window.last + 1;
				self.close(window, end)
			})
			.collect();
		rows.sort_by_key(|row| (row.end, row.start));
		rows
	}

	fn close(&self, window: OpenWindow, end: u64) -> Option<WindowRow> {
		if window.count < self.min_count {
			trace!(
				"Discarding threshold window [{}, {end}) with {} tuples",
				window.start,
				window.count
			);
			return None;
		}
		Some(WindowRow {
			start: window.start,
			end,
			keys: Vec::new(),
			aggs: window.cell.finalize(),
		})
	}
}
