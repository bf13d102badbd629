use crate::buf::block::BufferControlBlock;
use crate::buf::block::Pending;
use crate::buf::buffer::FloatingBuffer;
use crate::buf::buffer::PinnedBuffer;
use crate::buf::future::SingleShot;
use crate::buf::io::run_io_thread;
use crate::buf::io::IoRequest;
use crate::buf::io::PunchHoleResult;
use crate::buf::pool::FixedSizePool;
use crate::buf::pool::PoolQuota;
use crate::buf::segment::DiskSlot;
use crate::buf::segment::Segment;
use crate::buf::spill::SpillArena;
use crate::cnf;
use crate::cnf::BufferOptions;
use crate::err::Error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// A single-shot future resolving to a free in-memory segment
pub struct GetInMemorySegmentFuture {
	awaiter: Arc<SingleShot<Segment>>,
	shared: Weak<Inner>,
}

impl GetInMemorySegmentFuture {
	/// Checks once for the segment without blocking
	pub fn poll_once(&self) -> Result<Option<Segment>, Error> {
		self.awaiter.poll_once()
	}

	/// Blocks until the segment is available
	pub fn wait_once(&self) -> Result<Segment, Error> {
		self.awaiter.wait_once()
	}
}

impl Drop for GetInMemorySegmentFuture {
	fn drop(&mut self) {
		// A result that raced with the drop is recycled, not lost
		if let Some(segment) = self.awaiter.abandon() {
			if let Some(inner) = self.shared.upgrade() {
				inner.recycle(segment);
			}
		}
	}
}

/// A single-shot future resolving when a spilled segment became resident
pub struct ReadSegmentFuture {
	waiter: Arc<SingleShot<()>>,
}

impl ReadSegmentFuture {
	pub fn poll_once(&self) -> Result<Option<()>, Error> {
		self.waiter.poll_once()
	}

	pub fn wait_once(&self) -> Result<(), Error> {
		self.waiter.wait_once()
	}
}

impl Drop for ReadSegmentFuture {
	fn drop(&mut self) {
		self.waiter.abandon();
	}
}

/// A single-shot future resolving when a freed slot's hole was punched.
///
/// The promise is shared with the I/O thread, so the submitter may drop
/// this future before completion; the result is then discarded.
pub struct PunchHoleFuture {
	promise: Arc<SingleShot<PunchHoleResult>>,
}

impl PunchHoleFuture {
	pub fn poll_once(&self) -> Result<Option<PunchHoleResult>, Error> {
		self.promise.poll_once()
	}

	pub fn wait_once(&self) -> Result<PunchHoleResult, Error> {
		self.promise.wait_once()
	}
}

struct IoProgress {
	generation: Mutex<u64>,
	cond: Condvar,
}

struct Registry {
	blocks: Vec<Weak<BufferControlBlock>>,
	cursor: usize,
}

/// The state shared by a buffer manager, its handles and its I/O thread
pub(crate) struct Inner {
	opts: BufferOptions,
	free_tx: channel::Sender<Segment>,
	free_rx: channel::Receiver<Segment>,
	waiters_tx: channel::Sender<Arc<SingleShot<Segment>>>,
	waiters_rx: channel::Receiver<Arc<SingleShot<Segment>>>,
	io_tx: channel::Sender<IoRequest>,
	io_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
	arena: Arc<SpillArena>,
	registry: Mutex<Registry>,
	next_id: AtomicU64,
	writes_in_flight: AtomicUsize,
	progress: IoProgress,
}

impl Inner {
	/// Hands a released segment to the longest waiting awaiter, or back to
	/// the free queue
	pub fn recycle(&self, segment: Segment) {
		let mut segment = segment;
		while let Ok(awaiter) = self.waiters_rx.try_recv() {
			match awaiter.set_result_and_continue(segment) {
				// The awaiter was abandoned; try the next one
				Some(back) => segment = back,
				None => return,
			}
		}
		if self.free_tx.try_send(segment).is_err() {
			// The pool is full because this segment was allocated ad hoc
			error!("{}", Error::FailedToTransferCleanupOwnership);
		}
	}

	/// Returns an on-disk slot to the arena, punching its hole on the I/O
	/// thread when possible
	pub fn release_slot(&self, slot: DiskSlot) {
		let promise = Arc::new(SingleShot::new());
		let request = IoRequest::PunchHole {
			slot,
			promise: Arc::clone(&promise),
		};
		if self.io_tx.try_send(request).is_err() {
			self.arena.release(slot);
		}
		// The submitter drops its reference; the hole is punched regardless
		drop(PunchHoleFuture {
			promise,
		});
	}

	pub fn note_io_progress(&self) {
		let mut generation =
			self.progress.generation.lock().expect("unreachable: progress mutex poisoned");
		*generation += 1;
		self.progress.cond.notify_all();
	}

	pub fn write_done(&self) {
		self.writes_in_flight.fetch_sub(1, Ordering::AcqRel);
	}

	/// Runs one clock eviction cycle: sweep the control blocks with the
	/// second-chance hand and spill up to one batch of victims.
	///
	/// A victim must be floating, resident, without in-flight I/O, and its
	/// parent must not be pinned. A victim that already owns an on-disk
	/// copy surrenders its segment without further I/O. Children are
	/// spilled before their parent.
	fn evict_some(&self) -> Result<usize, Error> {
		let batch = self.opts.spill_batch.max(1);
		let mut registry = self.registry.lock().expect("unreachable: registry poisoned");
		registry.blocks.retain(|block| block.strong_count() > 0);
		let len = registry.blocks.len();
		if len == 0 {
			return Ok(0);
		}
		let mut progressed = 0;
		let mut scanned = 0;
		while progressed < batch && scanned < 2 * len {
			let idx = registry.cursor % len;
			registry.cursor = registry.cursor.wrapping_add(1);
			scanned += 1;
			let block = match registry.blocks[idx].upgrade() {
				Some(block) => block,
				None => continue,
			};
			if block.pins.load(Ordering::Acquire) > 0 {
				continue;
			}
			if block.spend_chance() {
				continue;
			}
			// Children are forcibly spilled before their parent
			let children: Vec<Arc<BufferControlBlock>> = block.state().children.clone();
			for child in children {
				if progressed >= batch {
					break;
				}
				if child.pins.load(Ordering::Acquire) > 0 {
					continue;
				}
				if self.spill_one(&child)? {
					progressed += 1;
				}
			}
			if progressed < batch && self.spill_one(&block)? {
				progressed += 1;
			}
		}
		trace!("Eviction cycle spilled {progressed} buffers");
		Ok(progressed)
	}

	/// Spills a single block, or steals its segment when a valid on-disk
	/// copy already exists. Returns whether any progress was made.
	fn spill_one(&self, block: &Arc<BufferControlBlock>) -> Result<bool, Error> {
		let mut state = block.state();
		if state.pending != Pending::None || state.segment.is_none() {
			return Ok(false);
		}
		if let Some(parent) = state.parent.upgrade() {
			// A child cannot be spilled while its parent is pinned
			if parent.pins.load(Ordering::Acquire) > 0 {
				return Ok(false);
			}
		}
		if state.disk.is_some() {
			// Spilled before; the on-disk copy is still authoritative
			let mut segment =
				state.segment.take().expect("unreachable: resident segment disappeared");
			drop(state);
			segment.reset();
			self.recycle(segment);
			return Ok(true);
		}
		let slot = self.arena.acquire()?;
		state.pending = Pending::Write;
		drop(state);
		self.writes_in_flight.fetch_add(1, Ordering::AcqRel);
		let request = IoRequest::Write {
			block: Arc::clone(block),
			slot,
		};
		if self.io_tx.try_send(request).is_err() {
			block.state().pending = Pending::None;
			self.write_done();
			self.arena.release(slot);
			return Err(Error::CannotSubmitBufferIo);
		}
		Ok(true)
	}

	/// Pops a free segment if one exists right now
	pub fn try_segment(&self) -> Option<Segment> {
		self.free_rx.try_recv().ok()
	}

	/// Pops a free segment or blocks until eviction produces one
	pub fn get_segment_blocking(&self) -> Result<Segment, Error> {
		if self.opts.num_buffers == 0 {
			return Err(Error::BufferPoolExhausted);
		}
		let mut attempt = 0;
		loop {
			if let Ok(segment) = self.free_rx.try_recv() {
				return Ok(segment);
			}
			let awaiter = Arc::new(SingleShot::new());
			if self.waiters_tx.try_send(Arc::clone(&awaiter)).is_err() {
				return Err(Error::CannotSubmitBufferIo);
			}
			match self.evict_some() {
				Ok(_) => {}
				Err(error) if error.is_transient() && attempt < *cnf::TRANSIENT_RETRIES => {
					if let Some(segment) = awaiter.abandon() {
						self.recycle(segment);
					}
					attempt += 1;
					std::thread::sleep(Duration::from_millis(attempt as u64));
					continue;
				}
				Err(error) => {
					if let Some(segment) = awaiter.abandon() {
						self.recycle(segment);
					}
					return Err(error);
				}
			}
			// A segment freed between the two queue operations would miss
			// our awaiter, so check the free queue once more
			if let Ok(segment) = self.free_rx.try_recv() {
				if let Some(extra) = awaiter.abandon() {
					self.recycle(extra);
				}
				return Ok(segment);
			}
			return awaiter.wait_once();
		}
	}

	/// Reads the block's segment back from disk if necessary, blocking
	/// until the buffer is resident. The caller must already hold a pin.
	pub fn ensure_resident(self: &Arc<Self>, block: &Arc<BufferControlBlock>) -> Result<(), Error> {
		let mut attempts = 0;
		loop {
			enum Step {
				Done,
				Wait(ReadSegmentFuture),
				Fetch(DiskSlot),
			}
			let step = {
				let mut state = block.state();
				if state.segment.is_some() {
					Step::Done
				} else if state.pending == Pending::Read {
					let waiter = Arc::new(SingleShot::new());
					state.read_waiters.push(Arc::clone(&waiter));
					Step::Wait(ReadSegmentFuture {
						waiter,
					})
				} else {
					match state.disk {
						Some(slot) => Step::Fetch(slot),
						None => {
							return Err(Error::Io(std::io::Error::other(
								"buffer is neither resident nor spilled",
							)))
						}
					}
				}
			};
			match step {
				Step::Done => return Ok(()),
				Step::Wait(future) => {
					future.wait_once()?;
				}
				Step::Fetch(slot) => {
					let target = self.get_segment_blocking()?;
					let future = self.submit_read(block, slot, target)?;
					if let Some(future) = future {
						future.wait_once()?;
					}
				}
			}
			attempts += 1;
			if attempts > *cnf::TRANSIENT_RETRIES {
				return Err(Error::Io(std::io::Error::other(
					"buffer could not be made resident",
				)));
			}
		}
	}

	/// Submits a read of `slot` into `target`; returns the future to wait
	/// on, or nothing when the buffer became resident concurrently
	fn submit_read(
		&self,
		block: &Arc<BufferControlBlock>,
		slot: DiskSlot,
		target: Segment,
	) -> Result<Option<ReadSegmentFuture>, Error> {
		let mut state = block.state();
		if state.segment.is_some() {
			drop(state);
			self.recycle(target);
			return Ok(None);
		}
		if state.pending == Pending::Read {
			// Another pinner submitted the read first
			let waiter = Arc::new(SingleShot::new());
			state.read_waiters.push(Arc::clone(&waiter));
			drop(state);
			self.recycle(target);
			return Ok(Some(ReadSegmentFuture {
				waiter,
			}));
		}
		state.pending = Pending::Read;
		let waiter = Arc::new(SingleShot::new());
		state.read_waiters.push(Arc::clone(&waiter));
		drop(state);
		let request = IoRequest::Read {
			block: Arc::clone(block),
			slot,
			target,
		};
		if self.io_tx.try_send(request).is_err() {
			let mut state = block.state();
			state.pending = Pending::None;
			// Wake the other waiters so they retry the submission
			for other in state.read_waiters.drain(..) {
				other.set_result_and_continue(());
			}
			return Err(Error::CannotSubmitBufferIo);
		}
		Ok(Some(ReadSegmentFuture {
			waiter,
		}))
	}

	fn register(&self, block: &Arc<BufferControlBlock>) {
		let mut registry = self.registry.lock().expect("unreachable: registry poisoned");
		registry.blocks.push(Arc::downgrade(block));
	}

	fn next_id(&self) -> u64 {
		self.next_id.fetch_add(1, Ordering::AcqRel)
	}

	/// Starts eviction ahead of demand when the free share drops below the
	/// configured watermark
	fn evict_ahead(&self) {
		let free = self.free_rx.len();
		if free * 100 < self.opts.num_buffers * self.opts.eviction_watermark {
			if let Err(error) = self.evict_some() {
				if error.is_transient() {
					trace!("Proactive eviction backed off: {error}");
				} else {
					warn!("Proactive eviction failed: {error}");
				}
			}
		}
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		if self.io_tx.try_send(IoRequest::Shutdown).is_err() {
			// A full queue cannot take the shutdown marker; closing the
			// channel unblocks the thread instead
			self.io_tx.close();
		}
		if let Some(handle) = self
			.io_thread
			.lock()
			.expect("unreachable: io thread handle poisoned")
			.take()
		{
			let _ = handle.join();
		}
	}
}

/// Hands out fixed-size memory segments backing tuple buffers.
///
/// Buffers are pinned while referenced, floating once unpinned, and spilled
/// to the disk arena by a clock eviction sweep when memory runs short. All
/// handles stay valid across spilling; re-pinning blocks until the data is
/// resident again.
#[derive(Clone)]
pub struct BufferManager {
	inner: Arc<Inner>,
}

impl BufferManager {
	/// Creates a manager with pre-allocated segments and a running I/O
	/// thread
	pub fn new(opts: BufferOptions) -> Result<Self, Error> {
		std::fs::create_dir_all(&opts.spill_dir)?;
		let (free_tx, free_rx) = channel::bounded(opts.num_buffers.max(1));
		let (waiters_tx, waiters_rx) = channel::unbounded();
		let (io_tx, io_rx) = channel::bounded(opts.io_queue_depth.max(1));
		let arena = Arc::new(SpillArena::new(
			opts.spill_dir.clone(),
			opts.buffer_size,
			*cnf::SPILL_FILE_SIZE,
		));
		for _ in 0..opts.num_buffers {
			free_tx
				.try_send(Segment::preallocated(opts.buffer_size))
				.map_err(|_| Error::FailedToTransferCleanupOwnership)?;
		}
		let inner = Arc::new(Inner {
			opts,
			free_tx,
			free_rx,
			waiters_tx,
			waiters_rx,
			io_tx,
			io_thread: Mutex::new(None),
			arena: Arc::clone(&arena),
			registry: Mutex::new(Registry {
				blocks: Vec::new(),
				cursor: 0,
			}),
			next_id: AtomicU64::new(0),
			writes_in_flight: AtomicUsize::new(0),
			progress: IoProgress {
				generation: Mutex::new(0),
				cond: Condvar::new(),
			},
		});
		let weak = Arc::downgrade(&inner);
		let batch = inner.opts.spill_batch.max(1);
		let handle = std::thread::Builder::new()
			.name("rill-buffer-io".to_owned())
			.spawn(move || run_io_thread(io_rx, arena, weak, batch))?;
		*inner.io_thread.lock().expect("unreachable: io thread handle poisoned") = Some(handle);
		debug!("Created buffer manager with {} buffers", inner.opts.num_buffers);
		Ok(BufferManager {
			inner,
		})
	}

	/// Creates a manager with default options
	pub fn with_defaults() -> Result<Self, Error> {
		BufferManager::new(BufferOptions::default())
	}

	/// The number of segments currently in the free queue
	pub fn available_buffers(&self) -> usize {
		self.inner.free_rx.len()
	}

	/// Returns a pinned buffer, blocking and evicting if necessary.
	///
	/// Fails with [`Error::BufferPoolExhausted`] only when the pool
	/// capacity was explicitly capped to zero.
	pub fn get_buffer_blocking(&self) -> Result<PinnedBuffer, Error> {
		let segment = self.inner.get_segment_blocking()?;
		self.inner.evict_ahead();
		Ok(self.wrap(segment, None))
	}

	/// Returns a pinned buffer only if a free segment exists right now
	pub fn get_buffer_no_blocking(&self) -> Option<PinnedBuffer> {
		let segment = self.inner.free_rx.try_recv().ok()?;
		Some(self.wrap(segment, None))
	}

	/// Creates a subpool with a hard cap of `capacity` pinned buffers
	pub fn create_fixed_size_pool(&self, capacity: usize) -> FixedSizePool {
		FixedSizePool::new(self.clone(), capacity)
	}

	/// Pins a floating buffer, reading it back from disk when spilled
	pub fn pin_buffer(&self, floating: FloatingBuffer) -> Result<PinnedBuffer, Error> {
		let block = floating.into_block();
		// Pin first so the eviction sweep cannot steal the segment while
		// the read is in flight
		block.pins.fetch_add(1, Ordering::AcqRel);
		block.touch();
		if let Err(error) = self.inner.ensure_resident(&block) {
			block.pins.fetch_sub(1, Ordering::AcqRel);
			return Err(error);
		}
		Ok(PinnedBuffer::adopt(block))
	}

	/// Requests a raw in-memory segment as a single-shot future
	pub fn get_in_memory_segment(&self) -> GetInMemorySegmentFuture {
		let awaiter = Arc::new(SingleShot::new());
		match self.inner.free_rx.try_recv() {
			Ok(segment) => {
				awaiter.set_result_and_continue(segment);
			}
			Err(_) => {
				let _ = self.inner.waiters_tx.try_send(Arc::clone(&awaiter));
				let _ = self.inner.evict_some();
			}
		}
		GetInMemorySegmentFuture {
			awaiter,
			shared: Arc::downgrade(&self.inner),
		}
	}

	/// Returns a raw segment to the pool
	pub fn recycle_segment(&self, segment: Segment) {
		self.inner.recycle(segment);
	}

	/// Blocks until the I/O thread finished its outstanding writes;
	/// returns immediately when no write is in flight
	pub fn wait_for_write_completion_once(&self) {
		let mut generation = self
			.inner
			.progress
			.generation
			.lock()
			.expect("unreachable: progress mutex poisoned");
		while self.inner.writes_in_flight.load(Ordering::Acquire) > 0 {
			let (next, _) = self
				.inner
				.progress
				.cond
				.wait_timeout(generation, Duration::from_millis(10))
				.expect("unreachable: progress mutex poisoned");
			generation = next;
		}
	}

	/// The configured size of one buffer in bytes
	pub fn buffer_size(&self) -> usize {
		self.inner.opts.buffer_size
	}

	pub(crate) fn wrap(&self, segment: Segment, quota: Option<Arc<PoolQuota>>) -> PinnedBuffer {
		let id = self.inner.next_id();
		let block = BufferControlBlock::new(id, segment, Arc::downgrade(&self.inner), quota);
		self.inner.register(&block);
		PinnedBuffer::new_pinned(block)
	}

	pub(crate) fn inner(&self) -> &Arc<Inner> {
		&self.inner
	}
}
