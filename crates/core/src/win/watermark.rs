use crate::plan::OriginId;
use ahash::AHashMap;
use ahash::AHashSet;
use std::sync::Mutex;

/// Tracks per-origin timestamps and derives the operator watermark.
///
/// The watermark is the minimum over all expected origins and only advances
/// once every origin has reported at least one timestamp. Within one origin
/// timestamps are monotonic; a stale update is ignored.
pub struct WatermarkTracker {
	expected: Vec<OriginId>,
	inner: Mutex<TrackerState>,
}

struct TrackerState {
	per_origin: AHashMap<OriginId, u64>,
	terminated: AHashSet<OriginId>,
	watermark: Option<u64>,
}

impl WatermarkTracker {
	pub fn new(expected: Vec<OriginId>) -> Self {
		WatermarkTracker {
			expected,
			inner: Mutex::new(TrackerState {
				per_origin: AHashMap::new(),
				terminated: AHashSet::new(),
				watermark: None,
			}),
		}
	}

	/// Records a per-origin timestamp; returns the new watermark when the
	/// minimum across all origins advanced
	pub fn update(&self, origin: OriginId, ts: u64) -> Option<u64> {
		let mut state = self.inner.lock().expect("unreachable: watermark tracker poisoned");
		let entry = state.per_origin.entry(origin).or_insert(0);
		if ts > *entry {
			*entry = ts;
		}
		self.advance(&mut state)
	}

	/// Marks an origin as terminated; its timestamp no longer holds the
	/// watermark back. Returns true once every origin has terminated.
	pub fn terminate(&self, origin: OriginId) -> bool {
		let mut state = self.inner.lock().expect("unreachable: watermark tracker poisoned");
		state.terminated.insert(origin);
		state.terminated.len() >= self.expected.len()
	}

	/// The current watermark, if every origin has reported
	pub fn current(&self) -> Option<u64> {
		self.inner.lock().expect("unreachable: watermark tracker poisoned").watermark
	}

	/// The number of expected origins
	pub fn expected_origins(&self) -> usize {
		self.expected.len()
	}

	/// The expected origin ids
	pub fn origins(&self) -> &[OriginId] {
		&self.expected
	}

	fn advance(&self, state: &mut TrackerState) -> Option<u64> {
		let mut minimum = u64::MAX;
		for origin in &self.expected {
			if state.terminated.contains(origin) {
				continue;
			}
			match state.per_origin.get(origin) {
				Some(ts) => minimum = minimum.min(*ts),
				// An origin that never reported holds the watermark at zero
				None => return None,
			}
		}
		if minimum == u64::MAX {
			return None;
		}
		match state.watermark {
			Some(current) if minimum <= current => None,
			_ => {
				state.watermark = Some(minimum);
				Some(minimum)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn watermark_is_the_minimum_over_origins() {
		let tracker = WatermarkTracker::new(vec![OriginId(1), OriginId(2)]);
		assert_eq!(tracker.update(OriginId(1), 100), None);
		assert_eq!(tracker.update(OriginId(2), 50), Some(50));
		assert_eq!(tracker.update(OriginId(2), 150), Some(100));
	}

	#[test]
	fn stale_updates_do_not_regress() {
		let tracker = WatermarkTracker::new(vec![OriginId(1)]);
		assert_eq!(tracker.update(OriginId(1), 100), Some(100));
		assert_eq!(tracker.update(OriginId(1), 40), None);
		assert_eq!(tracker.current(), Some(100));
	}

	#[test]
	fn terminated_origins_release_the_watermark() {
		let tracker = WatermarkTracker::new(vec![OriginId(1), OriginId(2)]);
		tracker.update(OriginId(1), 10);
		tracker.update(OriginId(2), 90);
		assert!(!tracker.terminate(OriginId(1)));
		assert_eq!(tracker.update(OriginId(2), 120), Some(120));
		assert!(tracker.terminate(OriginId(2)));
	}
}
