use crate::buf::segment::DiskSlot;
use crate::buf::segment::OFFSET_BITS;
use crate::err::Error;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// One large pre-allocated spill file with a bump allocator and a free list
pub(crate) struct SpillFile {
	id: u8,
	file: File,
	bump: AtomicU64,
	free: Mutex<Vec<u64>>,
	capacity: u64,
}

impl SpillFile {
	fn create(dir: &PathBuf, id: u8, capacity: u64) -> Result<Self, Error> {
		let path = dir.join(format!("rill-spill-{id}.buf"));
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)?;
		debug!("Created spill file {} with capacity {capacity}", path.display());
		Ok(SpillFile {
			id,
			file,
			bump: AtomicU64::new(0),
			free: Mutex::new(Vec::new()),
			capacity,
		})
	}

	/// Hands out one offset, from the free list first
	fn acquire(&self, len: u64) -> Option<DiskSlot> {
		if let Some(offset) = self.free.lock().expect("unreachable: free list poisoned").pop() {
			return Some(DiskSlot::new(self.id, offset));
		}
		let offset = self.bump.fetch_add(len, Ordering::SeqCst);
		if offset + len > self.capacity {
			// Over-reserved; the file stays usable through its free list
			return None;
		}
		Some(DiskSlot::new(self.id, offset))
	}

	/// Punches a hole over a freed region and returns the offset for re-use
	fn release(&self, offset: u64, len: u64) {
		self.punch_hole(offset, len);
		self.free.lock().expect("unreachable: free list poisoned").push(offset);
	}

	#[cfg(target_os = "linux")]
	fn punch_hole(&self, offset: u64, len: u64) {
		use std::os::fd::AsRawFd;
		// Failure to punch only costs disk space, never correctness
		let rc = unsafe {
			libc::fallocate(
				self.file.as_raw_fd(),
				libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
				offset as libc::off_t,
				len as libc::off_t,
			)
		};
		if rc != 0 {
			warn!("Punching a hole at offset {offset} failed: {}", std::io::Error::last_os_error());
		}
	}

	#[cfg(not(target_os = "linux"))]
	fn punch_hole(&self, _offset: u64, _len: u64) {}

	#[cfg(unix)]
	fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
		self.file.write_all_at(data, offset)?;
		Ok(())
	}

	#[cfg(unix)]
	fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<(), Error> {
		self.file.read_exact_at(out, offset)?;
		Ok(())
	}

	#[cfg(not(unix))]
	fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<(), Error> {
		Err(Error::SpillArenaFull {
			message: "spilling is only supported on unix targets".to_owned(),
		})
	}

	#[cfg(not(unix))]
	fn read_at(&self, _offset: u64, _out: &mut [u8]) -> Result<(), Error> {
		Err(Error::SpillArenaFull {
			message: "spilling is only supported on unix targets".to_owned(),
		})
	}
}

/// The arena of spill files shared by all buffers of one manager.
///
/// Each segment is written to exactly one `(file, offset)` pair; freed
/// offsets return to the owning file's free list after the hole is punched.
pub(crate) struct SpillArena {
	dir: PathBuf,
	segment_size: u64,
	file_capacity: u64,
	files: Mutex<Vec<std::sync::Arc<SpillFile>>>,
}

impl SpillArena {
	pub fn new(dir: PathBuf, segment_size: usize, file_capacity: u64) -> Self {
		SpillArena {
			dir,
			segment_size: segment_size as u64,
			file_capacity: file_capacity.min(1u64 << OFFSET_BITS),
			files: Mutex::new(Vec::new()),
		}
	}

	/// Chooses a `(file, offset)` pair for one segment
	pub fn acquire(&self) -> Result<DiskSlot, Error> {
		let mut files = self.files.lock().expect("unreachable: spill arena poisoned");
		for file in files.iter() {
			if let Some(slot) = file.acquire(self.segment_size) {
				return Ok(slot);
			}
		}
		// All current files are exhausted, open the next one
		let id = files.len() as u64 + 1;
		if id > u8::MAX as u64 {
			return Err(Error::SpillArenaFull {
				message: format!("all {} spill files are exhausted", u8::MAX),
			});
		}
		let file = std::sync::Arc::new(SpillFile::create(&self.dir, id as u8, self.file_capacity)?);
		let slot = file.acquire(self.segment_size);
		files.push(file);
		slot.ok_or_else(|| Error::SpillArenaFull {
			message: "a fresh spill file rejected its first slot".to_owned(),
		})
	}

	/// Returns a slot to its file's free list, punching a hole over it
	pub fn release(&self, slot: DiskSlot) {
		let files = self.files.lock().expect("unreachable: spill arena poisoned");
		if let Some(file) = files.get(slot.file_id() as usize - 1) {
			file.release(slot.offset(), self.segment_size);
		}
	}

	/// Writes one segment to its slot
	pub fn write(&self, slot: DiskSlot, data: &[u8]) -> Result<(), Error> {
		let file = self.file(slot)?;
		file.write_at(slot.offset(), data)
	}

	/// Reads one segment back from its slot
	pub fn read(&self, slot: DiskSlot, out: &mut [u8]) -> Result<(), Error> {
		let file = self.file(slot)?;
		file.read_at(slot.offset(), out)
	}

	fn file(&self, slot: DiskSlot) -> Result<std::sync::Arc<SpillFile>, Error> {
		let files = self.files.lock().expect("unreachable: spill arena poisoned");
		files.get(slot.file_id() as usize - 1).cloned().ok_or_else(|| Error::SpillArenaFull {
			message: format!("no spill file with id {}", slot.file_id()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use temp_dir::TempDir;

	#[test]
	fn round_trips_a_segment_through_disk() {
		let dir = TempDir::new().unwrap();
		let arena = SpillArena::new(dir.path().to_path_buf(), 64, 1024);
		let slot = arena.acquire().unwrap();
		arena.write(slot, &[7u8; 64]).unwrap();
		let mut out = [0u8; 64];
		arena.read(slot, &mut out).unwrap();
		assert_eq!(out, [7u8; 64]);
	}

	#[test]
	fn freed_slots_are_reused() {
		let dir = TempDir::new().unwrap();
		let arena = SpillArena::new(dir.path().to_path_buf(), 64, 1024);
		let first = arena.acquire().unwrap();
		arena.release(first);
		let second = arena.acquire().unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn overflows_into_the_next_file() {
		let dir = TempDir::new().unwrap();
		// Two segments per file
		let arena = SpillArena::new(dir.path().to_path_buf(), 64, 128);
		let a = arena.acquire().unwrap();
		let b = arena.acquire().unwrap();
		let c = arena.acquire().unwrap();
		assert_eq!(a.file_id(), 1);
		assert_eq!(b.file_id(), 1);
		assert_eq!(c.file_id(), 2);
	}
}
