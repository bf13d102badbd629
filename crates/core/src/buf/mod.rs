//! The tuple buffer manager.
//!
//! Fixed-size memory segments back the tuple buffers flowing through every
//! pipeline. A buffer is *pinned* while at least one [`PinnedBuffer`] handle
//! exists, *floating* once unpinned, and *spilled* after the clock eviction
//! sweep wrote it to the on-disk arena. Child buffers share their parent's
//! lifetime and are spilled before it.
//!
//! All buffer I/O goes through a submission queue drained by a dedicated
//! thread; suspension points are modelled as single-shot futures exposing
//! `poll_once` and `wait_once`.

pub(crate) mod block;
pub(crate) mod buffer;
pub(crate) mod future;
pub(crate) mod io;
pub(crate) mod manager;
pub(crate) mod pool;
pub(crate) mod segment;
pub(crate) mod spill;

pub use buffer::FloatingBuffer;
pub use buffer::PinnedBuffer;
pub use io::PunchHoleResult;
pub use manager::BufferManager;
pub use manager::GetInMemorySegmentFuture;
pub use manager::PunchHoleFuture;
pub use manager::ReadSegmentFuture;
pub use pool::FixedSizePool;
pub use segment::DiskSlot;
pub use segment::Segment;
