use crate::err::Error;
use crate::plan::OriginId;
use crate::win::slice::Slice;
use crate::win::slice::SliceData;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Ordered slice storage, keyed by origin and slice start.
///
/// Worker threads stage slices locally without touching this store; the
/// merging handler inserts them under the write lock, and window emission
/// reads under the shared lock.
#[derive(Default)]
pub struct SliceStore {
	slices: RwLock<AHashMap<OriginId, BTreeMap<u64, Slice>>>,
}

impl SliceStore {
	pub fn new() -> Self {
		SliceStore::default()
	}

	/// Inserts one staged slice, combining it with an existing slice over
	/// the same interval
	pub fn merge_into_global(&self, origin: OriginId, slice: Slice) -> Result<(), Error> {
		let mut slices = self.slices.write().expect("unreachable: slice store poisoned");
		let per_origin = slices.entry(origin).or_default();
		match per_origin.get_mut(&slice.start) {
			Some(existing) => existing.merge_from(&slice)?,
			None => {
				per_origin.insert(slice.start, slice);
			}
		}
		Ok(())
	}

	/// Combines all slices fully contained in `[wstart, wend)` across all
	/// origins into one window slice
	pub fn collect_window_output(&self, wstart: u64, wend: u64) -> Result<Option<Slice>, Error> {
		let slices = self.slices.read().expect("unreachable: slice store poisoned");
		let mut combined: Option<Slice> = None;
		for per_origin in slices.values() {
			for (_, slice) in per_origin.range(wstart..wend) {
				if slice.end > wend {
					continue;
				}
				match &mut combined {
					Some(window) => {
						// Re-frame the slice onto the window interval
						let mut patch = slice.clone();
						patch.start = wstart;
						patch.end = wend;
						window.merge_from(&patch)?;
					}
					None => {
						let mut window = slice.clone();
						window.start = wstart;
						window.end = wend;
						combined = Some(window);
					}
				}
			}
		}
		Ok(combined.filter(|window| window.tuples > 0))
	}

	/// The smallest slice start across all origins
	pub fn min_start(&self) -> Option<u64> {
		let slices = self.slices.read().expect("unreachable: slice store poisoned");
		slices.values().filter_map(|per_origin| per_origin.keys().next().copied()).min()
	}

	/// The largest slice end across all origins
	pub fn max_end(&self) -> Option<u64> {
		let slices = self.slices.read().expect("unreachable: slice store poisoned");
		slices.values().filter_map(|per_origin| per_origin.values().last().map(|s| s.end)).max()
	}

	/// Drops every slice whose end is at or below the horizon; returns how
	/// many were collected
	pub fn gc_below(&self, horizon: u64) -> usize {
		let mut slices = self.slices.write().expect("unreachable: slice store poisoned");
		let mut dropped = 0;
		for per_origin in slices.values_mut() {
			let before = per_origin.len();
			per_origin.retain(|_, slice| slice.end > horizon);
			dropped += before - per_origin.len();
		}
		dropped
	}

	/// Whether slices of one origin are non-overlapping and contiguous
	pub fn is_contiguous(&self, origin: OriginId) -> bool {
		let slices = self.slices.read().expect("unreachable: slice store poisoned");
		let Some(per_origin) = slices.get(&origin) else {
			return true;
		};
		let mut previous_end: Option<u64> = None;
		for slice in per_origin.values() {
			if let Some(previous) = previous_end {
				if slice.start < previous {
					return false;
				}
			}
			previous_end = Some(slice.end);
		}
		true
	}

	/// The number of keyed groups currently buffered, for diagnostics
	pub fn group_count(&self) -> usize {
		let slices = self.slices.read().expect("unreachable: slice store poisoned");
		slices
			.values()
			.flat_map(|per_origin| per_origin.values())
			.map(|slice| match &slice.data {
				SliceData::Global(_) => 1,
				SliceData::Keyed(cells) => cells.len(),
			})
			.sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::AggregateFunction;
	use crate::plan::Aggregation;
	use crate::sch::Kind;
	use crate::sch::Schema;
	use crate::sch::Value;

	fn global_slice(start: u64, end: u64, value: u64) -> Slice {
		let schema = Schema::from_fields([("s$value", Kind::U64)]).unwrap();
		let aggs = vec![Aggregation::new(AggregateFunction::Sum, "value", "sum")];
		let mut slice = Slice::global(start, end, &aggs, &schema).unwrap();
		if let SliceData::Global(cell) = &mut slice.data {
			cell.update(&[0], &[Value::U64(value)]).unwrap();
		}
		slice.tuples = 1;
		slice
	}

	#[test]
	fn merges_slices_over_the_same_interval() {
		let store = SliceStore::new();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 10)).unwrap();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 20)).unwrap();
		let window = store.collect_window_output(0, 1000).unwrap().unwrap();
		assert_eq!(window.tuples, 2);
		if let SliceData::Global(cell) = &window.data {
			assert_eq!(cell.finalize(), vec![Value::U64(30)]);
		} else {
			panic!("expected global window");
		}
	}

	#[test]
	fn combines_across_origins() {
		let store = SliceStore::new();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 5)).unwrap();
		store.merge_into_global(OriginId(2), global_slice(0, 1000, 7)).unwrap();
		let window = store.collect_window_output(0, 1000).unwrap().unwrap();
		assert_eq!(window.tuples, 2);
	}

	#[test]
	fn window_collection_ignores_out_of_range_slices() {
		let store = SliceStore::new();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 1)).unwrap();
		store.merge_into_global(OriginId(1), global_slice(1000, 2000, 2)).unwrap();
		let window = store.collect_window_output(1000, 2000).unwrap().unwrap();
		if let SliceData::Global(cell) = &window.data {
			assert_eq!(cell.finalize(), vec![Value::U64(2)]);
		}
	}

	#[test]
	fn garbage_collects_below_the_horizon() {
		let store = SliceStore::new();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 1)).unwrap();
		store.merge_into_global(OriginId(1), global_slice(1000, 2000, 2)).unwrap();
		assert_eq!(store.gc_below(1000), 1);
		assert!(store.collect_window_output(0, 1000).unwrap().is_none());
		assert!(store.collect_window_output(1000, 2000).unwrap().is_some());
	}

	#[test]
	fn contiguity_holds_after_merge() {
		let store = SliceStore::new();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 1)).unwrap();
		store.merge_into_global(OriginId(1), global_slice(1000, 2000, 2)).unwrap();
		store.merge_into_global(OriginId(1), global_slice(0, 1000, 3)).unwrap();
		assert!(store.is_contiguous(OriginId(1)));
	}
}
