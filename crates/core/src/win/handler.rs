use crate::err::Error;
use crate::plan::OriginId;
use crate::plan::WindowDefinition;
use crate::sch::Schema;
use crate::sch::Value;
use crate::win::slice::AggregationCell;
use crate::win::slice::Slice;
use crate::win::slice::SliceData;
use crate::win::store::SliceStore;
use crate::win::watermark::WatermarkTracker;
use crate::win::HandlerState;
use crate::win::StreamRecord;
use crate::win::WindowRow;
use ahash::AHashMap;
use std::sync::Mutex;

/// One staged unit travelling from pre-aggregation to merging
pub(crate) enum StagingEntry {
	Slice {
		origin: OriginId,
		slice: Slice,
	},
	Watermark {
		watermark: u64,
	},
	Terminal {
		origin: OriginId,
	},
}

struct WorkerSlices {
	open: AHashMap<(OriginId, u64), Slice>,
}

struct EmitState {
	next_window_start: Option<u64>,
	watermark: u64,
}

/// The shared state between the slice pre-aggregation operator, the slice
/// merging operator and the window sink of one windowed aggregation.
///
/// Worker threads pre-aggregate into their own open slices without shared
/// locks; sealed slices travel through the staging queue and are merged
/// into the global store, from which whole windows are emitted in
/// non-decreasing end order.
pub(crate) struct WindowCore {
	definition: WindowDefinition,
	schema: Schema,
	key_inputs: Vec<usize>,
	agg_inputs: Vec<usize>,
	size: u64,
	slide: u64,
	workers: Vec<Mutex<WorkerSlices>>,
	staging_tx: channel::Sender<StagingEntry>,
	staging_rx: channel::Receiver<StagingEntry>,
	tracker: WatermarkTracker,
	store: SliceStore,
	emit: Mutex<EmitState>,
	state: Mutex<HandlerState>,
}

impl WindowCore {
	pub fn new(
		definition: WindowDefinition,
		schema: Schema,
		origins: Vec<OriginId>,
		workers: usize,
	) -> Result<Self, Error> {
		let size = definition.window_type.size().ok_or_else(|| Error::InvalidWindow {
			id: Default::default(),
			message: "threshold windows have no slice decomposition".to_owned(),
		})?;
		let slide =
			definition.slice_len().expect("unreachable: sized window without a slide");
		let key_inputs = definition
			.keys
			.iter()
			.map(|key| schema.resolve(key))
			.collect::<Result<Vec<_>, _>>()?;
		let agg_inputs = definition
			.aggregations
			.iter()
			.map(|aggregation| schema.resolve(&aggregation.on_field))
			.collect::<Result<Vec<_>, _>>()?;
		let (staging_tx, staging_rx) = channel::unbounded();
		let workers = (0..workers.max(1))
			.map(|_| {
				Mutex::new(WorkerSlices {
					open: AHashMap::new(),
				})
			})
			.collect();
		Ok(WindowCore {
			definition,
			schema,
			key_inputs,
			agg_inputs,
			size,
			slide,
			workers,
			staging_tx,
			staging_rx,
			tracker: WatermarkTracker::new(origins),
			store: SliceStore::new(),
			emit: Mutex::new(EmitState {
				next_window_start: None,
				watermark: 0,
			}),
			state: Mutex::new(HandlerState::Running),
		})
	}

	/// Pre-aggregates one record into the worker's open slice
	pub fn on_record(
		&self,
		worker: usize,
		origin: OriginId,
		record: &StreamRecord,
	) -> Result<(), Error> {
		let slice_start = record.ts - record.ts % self.slide;
		let slice_end = slice_start + self.slide;
		let mut slices = self.workers[worker % self.workers.len()]
			.lock()
			.expect("unreachable: worker slices poisoned");
		let slice = match slices.open.entry((origin, slice_start)) {
			std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
			std::collections::hash_map::Entry::Vacant(entry) => {
				let slice = if self.definition.is_keyed() {
					Slice::keyed(slice_start, slice_end)
				} else {
					Slice::global(
						slice_start,
						slice_end,
						&self.definition.aggregations,
						&self.schema,
					)?
				};
				entry.insert(slice)
			}
		};
		slice.tuples += 1;
		match &mut slice.data {
			SliceData::Global(cell) => cell.update(&self.agg_inputs, &record.row)?,
			SliceData::Keyed(cells) => {
				let key: Vec<Value> =
					self.key_inputs.iter().map(|idx| record.row[*idx].clone()).collect();
				if !cells.contains_key(&key) {
					let cell =
						AggregationCell::new(&self.definition.aggregations, &self.schema)?;
					cells.insert(key.clone(), cell);
				}
				let cell = cells.get_mut(&key).expect("unreachable: cell was just inserted");
				cell.update(&self.agg_inputs, &record.row)?;
			}
		}
		Ok(())
	}

	/// Advances one origin's timestamp; seals and stages every slice below
	/// the new operator watermark
	pub fn on_watermark(&self, origin: OriginId, ts: u64) -> Result<(), Error> {
		if let Some(watermark) = self.tracker.update(origin, ts) {
			trace!("Window watermark advanced to {watermark}");
			self.seal_below(watermark)?;
			self.stage(StagingEntry::Watermark {
				watermark,
			})?;
		}
		Ok(())
	}

	/// Flushes all open slices and emits a terminal marker per origin
	pub fn drain(&self) -> Result<(), Error> {
		*self.state.lock().expect("unreachable: handler state poisoned") = HandlerState::Draining;
		self.seal_below(u64::MAX)?;
		for origin in self.tracker_origins() {
			self.stage(StagingEntry::Terminal {
				origin,
			})?;
		}
		Ok(())
	}

	/// Drains the staging queue, merges staged slices and returns every
	/// window that became complete
	pub fn poll_windows(&self) -> Result<Vec<WindowRow>, Error> {
		let mut rows = Vec::new();
		while let Ok(entry) = self.staging_rx.try_recv() {
			match entry {
				StagingEntry::Slice {
					origin,
					slice,
				} => self.store.merge_into_global(origin, slice)?,
				StagingEntry::Watermark {
					watermark,
				} => rows.extend(self.emit_ready(watermark, false)?),
				StagingEntry::Terminal {
					origin,
				} => {
					if self.tracker.terminate(origin) {
						// Every window still holding data must flush, so the
						// horizon reaches one full window past the last slice
						let horizon =
							self.store.max_end().unwrap_or(0).saturating_add(self.size);
						rows.extend(self.emit_ready(horizon, true)?);
						*self.state.lock().expect("unreachable: handler state poisoned") =
							HandlerState::Terminated;
					}
				}
			}
		}
		Ok(rows)
	}

	/// The current lifecycle state
	pub fn state(&self) -> HandlerState {
		*self.state.lock().expect("unreachable: handler state poisoned")
	}

	/// The current operator watermark
	pub fn watermark(&self) -> Option<u64> {
		self.tracker.current()
	}

	pub fn store(&self) -> &SliceStore {
		&self.store
	}

	pub fn definition(&self) -> &WindowDefinition {
		&self.definition
	}

	fn tracker_origins(&self) -> Vec<OriginId> {
		self.tracker.origins().to_vec()
	}

	fn stage(&self, entry: StagingEntry) -> Result<(), Error> {
		self.staging_tx.try_send(entry).map_err(|_| Error::CannotSubmitBufferIo)
	}

	/// Removes every open slice ending at or below the watermark from all
	/// workers and stages it for merging
	fn seal_below(&self, watermark: u64) -> Result<(), Error> {
		for worker in &self.workers {
			let mut slices = worker.lock().expect("unreachable: worker slices poisoned");
			let sealed: Vec<(OriginId, u64)> = slices
				.open
				.iter()
				.filter(|(_, slice)| slice.end <= watermark)
				.map(|((origin, start), _)| (*origin, *start))
				.collect();
			for key in sealed {
				if let Some(slice) = slices.open.remove(&key) {
					self.stage(StagingEntry::Slice {
						origin: key.0,
						slice,
					})?;
				}
			}
		}
		Ok(())
	}

	/// Emits every window whose end passed the watermark, in
	/// non-decreasing end order, then garbage-collects old slices
	fn emit_ready(&self, watermark: u64, force: bool) -> Result<Vec<WindowRow>, Error> {
		let mut emit = self.emit.lock().expect("unreachable: emit state poisoned");
		emit.watermark = emit.watermark.max(watermark);
		if emit.next_window_start.is_none() {
			emit.next_window_start = self.store.min_start().map(|start| {
				let aligned = start - start % self.slide;
				aligned.saturating_sub(self.size - self.slide)
			});
		}
		let mut rows = Vec::new();
		while let Some(wstart) = emit.next_window_start {
			let wend = wstart + self.size;
			if wend > watermark {
				break;
			}
			if force && self.store.max_end().map_or(true, |max| wstart >= max) {
				break;
			}
			if let Some(window) = self.store.collect_window_output(wstart, wend)? {
				rows.extend(self.window_rows(wstart, wend, window));
			}
			emit.next_window_start = Some(wstart + self.slide);
		}
		if !force {
			let horizon = watermark.saturating_sub(self.definition.max_window_size());
			let dropped = self.store.gc_below(horizon);
			if dropped > 0 {
				trace!("Collected {dropped} slices below {horizon}");
			}
		}
		Ok(rows)
	}

	fn window_rows(&self, wstart: u64, wend: u64, window: Slice) -> Vec<WindowRow> {
		match window.data {
			SliceData::Global(cell) => vec![WindowRow {
				start: wstart,
				end: wend,
				keys: Vec::new(),
				aggs: cell.finalize(),
			}],
			SliceData::Keyed(cells) => {
				let mut rows: Vec<WindowRow> = cells
					.into_iter()
					.map(|(keys, cell)| WindowRow {
						start: wstart,
						end: wend,
						keys,
						aggs: cell.finalize(),
					})
					.collect();
				rows.sort_by(|a, b| {
					a.keys
						.partial_cmp(&b.keys)
						.unwrap_or(std::cmp::Ordering::Equal)
				});
				rows
			}
		}
	}
}

/// The shared handler of a keyed windowed aggregation
pub struct KeyedWindowHandler {
	core: WindowCore,
}

impl KeyedWindowHandler {
	pub fn new(
		definition: WindowDefinition,
		schema: Schema,
		origins: Vec<OriginId>,
		workers: usize,
	) -> Result<Self, Error> {
		debug_assert!(definition.is_keyed());
		Ok(KeyedWindowHandler {
			core: WindowCore::new(definition, schema, origins, workers)?,
		})
	}

	pub fn on_record(&self, worker: usize, origin: OriginId, record: &StreamRecord) -> Result<(), Error> {
		self.core.on_record(worker, origin, record)
	}

	pub fn on_watermark(&self, origin: OriginId, ts: u64) -> Result<(), Error> {
		self.core.on_watermark(origin, ts)
	}

	pub fn poll_windows(&self) -> Result<Vec<WindowRow>, Error> {
		self.core.poll_windows()
	}

	pub fn drain(&self) -> Result<(), Error> {
		self.core.drain()
	}

	pub fn state(&self) -> HandlerState {
		self.core.state()
	}

	pub fn watermark(&self) -> Option<u64> {
		self.core.watermark()
	}

	pub fn definition(&self) -> &WindowDefinition {
		self.core.definition()
	}
}

/// The shared handler of a global (un-keyed) windowed aggregation
pub struct GlobalWindowHandler {
	core: WindowCore,
}

impl GlobalWindowHandler {
	pub fn new(
		definition: WindowDefinition,
		schema: Schema,
		origins: Vec<OriginId>,
		workers: usize,
	) -> Result<Self, Error> {
		debug_assert!(!definition.is_keyed());
		Ok(GlobalWindowHandler {
			core: WindowCore::new(definition, schema, origins, workers)?,
		})
	}

	pub fn on_record(&self, worker: usize, origin: OriginId, record: &StreamRecord) -> Result<(), Error> {
		self.core.on_record(worker, origin, record)
	}

	pub fn on_watermark(&self, origin: OriginId, ts: u64) -> Result<(), Error> {
		self.core.on_watermark(origin, ts)
	}

	pub fn poll_windows(&self) -> Result<Vec<WindowRow>, Error> {
		self.core.poll_windows()
	}

	pub fn drain(&self) -> Result<(), Error> {
		self.core.drain()
	}

	pub fn state(&self) -> HandlerState {
		self.core.state()
	}

	pub fn watermark(&self) -> Option<u64> {
		self.core.watermark()
	}

	pub fn definition(&self) -> &WindowDefinition {
		self.core.definition()
	}
}
