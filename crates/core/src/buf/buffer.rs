use crate::buf::block::BufferControlBlock;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// An owned reference to a resident tuple buffer.
///
/// A pinned buffer can never be spilled; dropping the last pin turns the
/// underlying segment floating, and dropping the last handle altogether
/// returns the segment to the pool.
pub struct PinnedBuffer {
	block: Option<Arc<BufferControlBlock>>,
}

impl PinnedBuffer {
	/// Wraps a block, taking one pin
	pub(crate) fn new_pinned(block: Arc<BufferControlBlock>) -> Self {
		block.pins.fetch_add(1, Ordering::AcqRel);
		block.touch();
		PinnedBuffer {
			block: Some(block),
		}
	}

	/// Wraps a block whose pin was already taken by the caller
	pub(crate) fn adopt(block: Arc<BufferControlBlock>) -> Self {
		PinnedBuffer {
			block: Some(block),
		}
	}

	pub(crate) fn block(&self) -> &Arc<BufferControlBlock> {
		self.block.as_ref().expect("unreachable: pinned buffer already consumed")
	}

	/// Consumes the handle without releasing its pin; the pin transfers to
	/// the returned block
	pub(crate) fn into_block(mut self) -> Arc<BufferControlBlock> {
		self.block.take().expect("unreachable: pinned buffer already consumed")
	}

	/// The stable identity of the underlying buffer
	pub fn id(&self) -> u64 {
		self.block().id
	}

	/// The buffer size in bytes
	pub fn len(&self) -> usize {
		self.with_data(|data| data.len())
	}

	/// Whether the buffer holds no bytes
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Runs a closure over the buffer contents
	pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		let state = self.block().state();
		f(state.segment.as_ref().expect("unreachable: pinned buffer is not resident").data())
	}

	/// Runs a closure over the mutable buffer contents
	pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let mut state = self.block().state();
		f(state.segment.as_mut().expect("unreachable: pinned buffer is not resident").data_mut())
	}

	/// Fills the whole buffer with one byte value
	pub fn fill(&self, value: u8) {
		self.with_data_mut(|data| data.fill(value));
	}

	/// Copies `src` into the buffer at `offset`
	pub fn write_at(&self, offset: usize, src: &[u8]) {
		self.with_data_mut(|data| data[offset..offset + src.len()].copy_from_slice(src));
	}

	/// Copies buffer contents at `offset` into `out`
	pub fn read_at(&self, offset: usize, out: &mut [u8]) {
		self.with_data(|data| out.copy_from_slice(&data[offset..offset + out.len()]));
	}

	/// The full buffer contents as an owned vector
	pub fn to_vec(&self) -> Vec<u8> {
		self.with_data(|data| data.to_vec())
	}

	/// Attaches `child` to this buffer so both share one lifetime.
	///
	/// The child is consumed; on success a new pinned handle to it is
	/// returned. Attachment fails when the child holds other live pins or
	/// already has a parent.
	pub fn store_return_as_child_buffer(&self, child: PinnedBuffer) -> Option<PinnedBuffer> {
		if Arc::ptr_eq(self.block(), child.block()) {
			return None;
		}
		if child.block().pins.load(Ordering::Acquire) != 1 {
			return None;
		}
		{
			let child_state = child.block().state();
			if child_state.parent.upgrade().is_some() {
				return None;
			}
		}
		let child_block = child.into_block();
		// Parent before child, the lock order used by the eviction sweep
		let mut parent_state = self.block().state();
		let mut child_state = child_block.state();
		child_state.parent = Arc::downgrade(self.block());
		drop(child_state);
		parent_state.children.push(Arc::clone(&child_block));
		drop(parent_state);
		Some(PinnedBuffer::adopt(child_block))
	}

	/// The ids of all attached children
	pub fn child_ids(&self) -> Vec<u64> {
		self.block().state().children.iter().map(|c| c.id).collect()
	}
}

impl Clone for PinnedBuffer {
	fn clone(&self) -> Self {
		PinnedBuffer::new_pinned(Arc::clone(self.block()))
	}
}

impl Drop for PinnedBuffer {
	fn drop(&mut self) {
		if let Some(block) = self.block.take() {
			block.pins.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

/// An unpinned reference to a tuple buffer, eligible for spilling.
///
/// The handle stays valid while the buffer moves to disk; pin it again
/// through the buffer manager to access the data.
pub struct FloatingBuffer {
	block: Option<Arc<BufferControlBlock>>,
}

impl FloatingBuffer {
	/// The stable identity of the underlying buffer
	pub fn id(&self) -> u64 {
		self.block().id
	}

	/// Whether the authoritative copy of this buffer is on disk
	pub fn is_spilled(&self) -> bool {
		self.block().is_spilled()
	}

	pub(crate) fn block(&self) -> &Arc<BufferControlBlock> {
		self.block.as_ref().expect("unreachable: floating buffer already consumed")
	}

	pub(crate) fn into_block(mut self) -> Arc<BufferControlBlock> {
		self.block.take().expect("unreachable: floating buffer already consumed")
	}
}

impl From<PinnedBuffer> for FloatingBuffer {
	fn from(pinned: PinnedBuffer) -> Self {
		let block = pinned.into_block();
		block.pins.fetch_sub(1, Ordering::AcqRel);
		block.touch();
		FloatingBuffer {
			block: Some(block),
		}
	}
}

impl std::fmt::Debug for PinnedBuffer {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("PinnedBuffer").field("id", &self.id()).finish()
	}
}

impl std::fmt::Debug for FloatingBuffer {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("FloatingBuffer")
			.field("id", &self.id())
			.field("spilled", &self.is_spilled())
			.finish()
	}
}
