use crate::buf::block::BufferControlBlock;
use crate::buf::block::Pending;
use crate::buf::future::SingleShot;
use crate::buf::manager::Inner;
use crate::buf::segment::DiskSlot;
use crate::buf::segment::Segment;
use crate::buf::spill::SpillArena;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// The result of a completed hole punch
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PunchHoleResult {
	pub slot: DiskSlot,
}

/// One entry of the buffer I/O submission queue
pub(crate) enum IoRequest {
	/// Spill one segment to the given slot; the control block flips to its
	/// on-disk location only after the write is acknowledged
	Write {
		block: Arc<BufferControlBlock>,
		slot: DiskSlot,
	},
	/// Read a spilled segment back into a freshly allocated target
	Read {
		block: Arc<BufferControlBlock>,
		slot: DiskSlot,
		target: Segment,
	},
	/// Reclaim the disk space of a released slot
	PunchHole {
		slot: DiskSlot,
		promise: Arc<SingleShot<PunchHoleResult>>,
	},
	Shutdown,
}

/// Drains the submission queue in batches, performing the file I/O and
/// delivering results under each block's mutex
pub(crate) fn run_io_thread(
	queue: channel::Receiver<IoRequest>,
	arena: Arc<SpillArena>,
	inner: Weak<Inner>,
	batch_size: usize,
) {
	let mut batch = Vec::with_capacity(batch_size);
	'outer: loop {
		match queue.recv_blocking() {
			Ok(request) => batch.push(request),
			Err(_) => break,
		}
		while batch.len() < batch_size {
			match queue.try_recv() {
				Ok(request) => batch.push(request),
				Err(_) => break,
			}
		}
		for request in batch.drain(..) {
			match request {
				IoRequest::Write {
					block,
					slot,
				} => {
					complete_write(&arena, &inner, block, slot);
					if let Some(inner) = inner.upgrade() {
						inner.write_done();
					}
				}
				IoRequest::Read {
					block,
					slot,
					target,
				} => complete_read(&arena, &inner, block, slot, target),
				IoRequest::PunchHole {
					slot,
					promise,
				} => {
					arena.release(slot);
					promise.set_result_and_continue(PunchHoleResult {
						slot,
					});
				}
				IoRequest::Shutdown => break 'outer,
			}
		}
		if let Some(inner) = inner.upgrade() {
			inner.note_io_progress();
		}
	}
	trace!("Buffer I/O thread finished");
}

fn complete_write(
	arena: &SpillArena,
	inner: &Weak<Inner>,
	block: Arc<BufferControlBlock>,
	slot: DiskSlot,
) {
	let mut state = block.state();
	let written = match &state.segment {
		Some(segment) if state.pending == Pending::Write => arena.write(slot, segment.data()),
		_ => {
			// The write was revoked before it reached the queue
			if let Some(inner) = inner.upgrade() {
				inner.release_slot(slot);
			}
			return;
		}
	};
	if let Err(error) = written {
		error!("Spilling buffer {} to {slot} failed: {error}", block.id);
		state.pending = Pending::None;
		if let Some(inner) = inner.upgrade() {
			inner.release_slot(slot);
		}
		return;
	}
	// The kernel acknowledged the write; the block now owns a valid
	// on-disk copy and the segment can be stolen, unless the buffer was
	// re-pinned while the write was in flight
	state.pending = Pending::None;
	state.disk = Some(slot);
	trace!("Spilled buffer {} to {slot}", block.id);
	if block.pins.load(Ordering::Acquire) == 0 {
		if let Some(mut segment) = state.segment.take() {
			drop(state);
			segment.reset();
			if let Some(inner) = inner.upgrade() {
				inner.recycle(segment);
			}
		}
	}
}

fn complete_read(
	arena: &SpillArena,
	inner: &Weak<Inner>,
	block: Arc<BufferControlBlock>,
	slot: DiskSlot,
	mut target: Segment,
) {
	let read = arena.read(slot, target.data_mut());
	let mut state = block.state();
	match read {
		Ok(()) => {
			trace!("Re-pinned buffer {} from {slot}", block.id);
			state.segment = Some(target);
		}
		Err(error) => {
			error!("Reading buffer {} from {slot} failed: {error}", block.id);
			target.reset();
			if let Some(inner) = inner.upgrade() {
				inner.recycle(target);
			}
		}
	}
	state.pending = Pending::None;
	for waiter in state.read_waiters.drain(..) {
		waiter.set_result_and_continue(());
	}
}
