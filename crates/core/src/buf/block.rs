use crate::buf::future::SingleShot;
use crate::buf::manager::Inner;
use crate::buf::segment::DiskSlot;
use crate::buf::segment::Segment;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// The I/O operation currently in flight for one buffer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Pending {
	None,
	/// A spill write was submitted but the kernel has not acknowledged it;
	/// reads still see the in-memory copy
	Write,
	/// A read from disk was submitted into a fresh segment
	Read,
}

/// The guarded state of one buffer control block
pub(crate) struct BlockState {
	/// The resident copy, present while the buffer is in memory
	pub segment: Option<Segment>,
	/// The acknowledged on-disk copy; set at most once per segment
	pub disk: Option<DiskSlot>,
	pub pending: Pending,
	/// Strong references keep children alive for the parent's lifetime
	pub children: Vec<Arc<BufferControlBlock>>,
	/// Back-pointer; only the buffer manager upgrades it, under this mutex
	pub parent: Weak<BufferControlBlock>,
	/// Waiters blocked on an in-flight read of this buffer
	pub read_waiters: Vec<Arc<SingleShot<()>>>,
}

/// Reference counting and location state shared by all handles to a buffer.
///
/// State transitions are guarded by the block mutex; pin counts and the
/// second-chance counter are atomics so the eviction sweep can inspect them
/// without locking every block.
pub(crate) struct BufferControlBlock {
	pub id: u64,
	pub pins: AtomicU32,
	/// Second-chance counter decremented by the clock sweep
	pub chances: AtomicU32,
	state: Mutex<BlockState>,
	pub shared: Weak<Inner>,
	pub quota: Option<Arc<crate::buf::pool::PoolQuota>>,
}

impl BufferControlBlock {
	pub fn new(
		id: u64,
		segment: Segment,
		shared: Weak<Inner>,
		quota: Option<Arc<crate::buf::pool::PoolQuota>>,
	) -> Arc<Self> {
		Arc::new(BufferControlBlock {
			id,
			pins: AtomicU32::new(0),
			chances: AtomicU32::new(0),
			state: Mutex::new(BlockState {
				segment: Some(segment),
				disk: None,
				pending: Pending::None,
				children: Vec::new(),
				parent: Weak::new(),
				read_waiters: Vec::new(),
			}),
			shared,
			quota,
		})
	}

	pub fn state(&self) -> MutexGuard<'_, BlockState> {
		self.state.lock().expect("unreachable: buffer control block poisoned")
	}

	/// Whether the authoritative copy of this buffer is on disk
	pub fn is_spilled(&self) -> bool {
		let state = self.state();
		state.disk.is_some() && state.segment.is_none()
	}

	/// Grants one more second chance before the clock sweep selects this
	/// buffer again
	pub fn touch(&self) {
		self.chances.store(1, Ordering::Release);
	}

	/// Consumes one second chance; returns true if one was left
	pub fn spend_chance(&self) -> bool {
		self.chances
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
			.is_ok()
	}
}

impl Drop for BufferControlBlock {
	fn drop(&mut self) {
		let state = self.state.get_mut().expect("unreachable: buffer control block poisoned");
		let segment = state.segment.take();
		let disk = state.disk.take();
		if let Some(inner) = self.shared.upgrade() {
			if let Some(mut segment) = segment {
				segment.reset();
				inner.recycle(segment);
			}
			if let Some(slot) = disk {
				inner.release_slot(slot);
			}
		} else if segment.is_some() {
			// The manager is already gone; the segment memory is simply freed
			trace!("Dropping buffer {} after its manager", self.id);
		}
		if let Some(quota) = &self.quota {
			quota.refund();
		}
	}
}
