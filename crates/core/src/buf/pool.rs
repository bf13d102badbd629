use crate::buf::buffer::PinnedBuffer;
use crate::buf::manager::BufferManager;
use crate::err::Error;
use std::sync::{Arc, Condvar, Mutex};

/// Counts the buffers a fixed-size pool may still hand out
pub(crate) struct PoolQuota {
	remaining: Mutex<usize>,
	cond: Condvar,
}

impl PoolQuota {
	fn new(capacity: usize) -> Self {
		PoolQuota {
			remaining: Mutex::new(capacity),
			cond: Condvar::new(),
		}
	}

	fn try_take(&self) -> bool {
		let mut remaining = self.remaining.lock().expect("unreachable: pool quota poisoned");
		if *remaining == 0 {
			return false;
		}
		*remaining -= 1;
		true
	}

	fn take_blocking(&self) {
		let mut remaining = self.remaining.lock().expect("unreachable: pool quota poisoned");
		while *remaining == 0 {
			remaining = self.cond.wait(remaining).expect("unreachable: pool quota poisoned");
		}
		*remaining -= 1;
	}

	pub fn refund(&self) {
		let mut remaining = self.remaining.lock().expect("unreachable: pool quota poisoned");
		*remaining += 1;
		self.cond.notify_one();
	}
}

/// A subpool with a hard cap on the number of simultaneously pinned
/// buffers; requests beyond the cap return empty
pub struct FixedSizePool {
	manager: BufferManager,
	quota: Arc<PoolQuota>,
}

impl FixedSizePool {
	pub(crate) fn new(manager: BufferManager, capacity: usize) -> Self {
		FixedSizePool {
			manager,
			quota: Arc::new(PoolQuota::new(capacity)),
		}
	}

	/// Returns a pinned buffer unless the cap is reached or no free
	/// segment exists
	pub fn get_buffer_no_blocking(&self) -> Option<PinnedBuffer> {
		if !self.quota.try_take() {
			return None;
		}
		match self.manager.inner().try_segment() {
			Some(segment) => Some(self.manager.wrap(segment, Some(Arc::clone(&self.quota)))),
			None => {
				self.quota.refund();
				None
			}
		}
	}

	/// Returns a pinned buffer, waiting for the cap and for a free segment
	pub fn get_buffer_blocking(&self) -> Result<PinnedBuffer, Error> {
		self.quota.take_blocking();
		match self.manager.inner().get_segment_blocking() {
			Ok(segment) => Ok(self.manager.wrap(segment, Some(Arc::clone(&self.quota)))),
			Err(error) => {
				self.quota.refund();
				Err(error)
			}
		}
	}
}
