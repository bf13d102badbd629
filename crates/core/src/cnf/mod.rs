use once_cell::sync::Lazy;
use std::path::PathBuf;

/// The default size of a single tuple buffer in bytes
pub static BUFFER_SIZE: Lazy<usize> = lazy_env_parse!("RILL_BUFFER_SIZE", usize, 4096);

/// The default number of tuple buffers held by the buffer manager
pub static NUM_BUFFERS: Lazy<usize> = lazy_env_parse!("RILL_NUM_BUFFERS", usize, 1024);

/// The default number of buffers pre-allocated for each fixed-size pool
pub static PRE_ALLOCATED_PER_POOL: Lazy<usize> =
	lazy_env_parse!("RILL_PRE_ALLOCATED_PER_POOL", usize, 64);

/// The fraction of in-memory buffers below which eviction starts, in percent
pub static EVICTION_WATERMARK: Lazy<usize> = lazy_env_parse!("RILL_EVICTION_WATERMARK", usize, 10);

/// How many spill victims are written per eviction cycle
pub static SPILL_BATCH_SIZE: Lazy<usize> = lazy_env_parse!("RILL_SPILL_BATCH_SIZE", usize, 64);

/// The depth of the buffer I/O submission queue
pub static IO_QUEUE_DEPTH: Lazy<usize> = lazy_env_parse!("RILL_IO_QUEUE_DEPTH", usize, 256);

/// The maximum size of a single spill file in bytes; offsets use 48 bits
pub static SPILL_FILE_SIZE: Lazy<u64> =
	lazy_env_parse!("RILL_SPILL_FILE_SIZE", u64, 4 * 1024 * 1024 * 1024);

/// How many times a transient buffer error is retried before surfacing
pub static TRANSIENT_RETRIES: Lazy<usize> = lazy_env_parse!("RILL_TRANSIENT_RETRIES", usize, 8);

/// The total size of a shared hash join table in bytes
pub static HASH_JOIN_TOTAL_SIZE: Lazy<usize> =
	lazy_env_parse!("RILL_HASH_JOIN_TOTAL_SIZE", usize, 2 * 1024 * 1024);

/// The page size of paged join state in bytes
pub static HASH_JOIN_PAGE_SIZE: Lazy<usize> =
	lazy_env_parse!("RILL_HASH_JOIN_PAGE_SIZE", usize, 128 * 1024);

/// How many join pages are allocated ahead of time per window
pub static HASH_JOIN_PRE_ALLOC_PAGES: Lazy<usize> =
	lazy_env_parse!("RILL_HASH_JOIN_PRE_ALLOC_PAGES", usize, 1);

/// How many partitions a shared hash join table is striped into
pub static HASH_JOIN_NUM_PARTITIONS: Lazy<usize> =
	lazy_env_parse!("RILL_HASH_JOIN_NUM_PARTITIONS", usize, 16);

/// Which engine compiles physical pipelines
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QueryCompilerType {
	/// Interpret the physical operators directly
	#[default]
	Default,
	/// Lower stage pipelines to the execution IR first
	Compiled,
}

/// Which windowing runtime the lowering phase targets
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WindowingStrategy {
	/// The single central window operator
	Legacy,
	/// Thread-local slice pre-aggregation with a merge stage
	#[default]
	ThreadLocal,
}

/// Which join implementation the lowering phase selects
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StreamJoinStrategy {
	/// Per-worker hash tables merged at the window boundary
	#[default]
	HashJoinLocal,
	/// A single shared table guarded by a striped lock
	HashJoinGlobalLocking,
	/// A single shared table with a lock-free insert protocol
	HashJoinGlobalLockFree,
	/// Paged tuple vectors probed pairwise
	NestedLoopJoin,
}

/// Geometry of the shared join state
#[derive(Clone, Copy, Debug)]
pub struct HashJoinOptions {
	pub total_size: usize,
	pub page_size: usize,
	pub pre_alloc_pages: usize,
	pub num_partitions: usize,
}

impl Default for HashJoinOptions {
	fn default() -> Self {
		HashJoinOptions {
			total_size: *HASH_JOIN_TOTAL_SIZE,
			page_size: *HASH_JOIN_PAGE_SIZE,
			pre_alloc_pages: *HASH_JOIN_PRE_ALLOC_PAGES,
			num_partitions: *HASH_JOIN_NUM_PARTITIONS,
		}
	}
}

/// Options consumed by the lowering phase and the pipeline compiler
#[derive(Clone, Debug)]
pub struct CompilerOptions {
	pub compiler_type: QueryCompilerType,
	pub windowing_strategy: WindowingStrategy,
	pub join_strategy: StreamJoinStrategy,
	pub hash_join: HashJoinOptions,
	/// How many worker threads feed each stateful operator handler
	pub worker_threads: usize,
}

impl Default for CompilerOptions {
	fn default() -> Self {
		CompilerOptions {
			compiler_type: QueryCompilerType::default(),
			windowing_strategy: WindowingStrategy::default(),
			join_strategy: StreamJoinStrategy::default(),
			hash_join: HashJoinOptions::default(),
			worker_threads: 1,
		}
	}
}

/// Options consumed by the buffer manager
#[derive(Clone, Debug)]
pub struct BufferOptions {
	/// Size of a single buffer in bytes
	pub buffer_size: usize,
	/// Total number of in-memory segments
	pub num_buffers: usize,
	/// Segments pre-allocated per fixed-size pool
	pub pre_allocated_per_pool: usize,
	/// Percentage of free segments below which eviction starts
	pub eviction_watermark: usize,
	/// Victims written per eviction cycle
	pub spill_batch: usize,
	/// Depth of the I/O submission queue
	pub io_queue_depth: usize,
	/// Directory holding the spill file arena
	pub spill_dir: PathBuf,
}

impl Default for BufferOptions {
	fn default() -> Self {
		BufferOptions {
			buffer_size: *BUFFER_SIZE,
			num_buffers: *NUM_BUFFERS,
			pre_allocated_per_pool: *PRE_ALLOCATED_PER_POOL,
			eviction_watermark: *EVICTION_WATERMARK,
			spill_batch: *SPILL_BATCH_SIZE,
			io_queue_depth: *IO_QUEUE_DEPTH,
			spill_dir: std::env::temp_dir(),
		}
	}
}

impl BufferOptions {
	/// Buffer options with an explicit pool geometry
	pub fn sized(buffer_size: usize, num_buffers: usize) -> Self {
		BufferOptions {
			buffer_size,
			num_buffers,
			..Default::default()
		}
	}
	/// Overrides the spill batch size
	pub fn with_spill_batch(mut self, spill_batch: usize) -> Self {
		self.spill_batch = spill_batch;
		self
	}
	/// Overrides the spill directory
	pub fn with_spill_dir(mut self, spill_dir: impl Into<PathBuf>) -> Self {
		self.spill_dir = spill_dir.into();
		self
	}
}
