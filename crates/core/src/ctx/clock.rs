use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// The clock driving ingestion-time watermarks
#[derive(Clone)]
#[non_exhaustive]
pub enum SizedClock {
	System(SystemClock),
	#[cfg(test)]
	Fake(FakeClock),
}

impl SizedClock {
	/// The current time in milliseconds
	pub fn now(&self) -> u64 {
		match self {
			SizedClock::System(c) => c.now(),
			#[cfg(test)]
			SizedClock::Fake(c) => c.now(),
		}
	}
}

impl Default for SizedClock {
	fn default() -> Self {
		SizedClock::System(SystemClock)
	}
}

/// FakeClock is a clock that is fully controlled externally.
/// Use this clock for when you are testing ingestion timestamps.
#[non_exhaustive]
pub struct FakeClock {
	now: AtomicU64,
}

impl Clone for FakeClock {
	fn clone(&self) -> Self {
		FakeClock {
			now: AtomicU64::new(self.now.load(Ordering::SeqCst)),
		}
	}
}

#[allow(dead_code)]
impl FakeClock {
	pub fn new(now: u64) -> Self {
		FakeClock {
			now: AtomicU64::new(now),
		}
	}

	pub fn now(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}

	pub fn set(&self, now: u64) {
		self.now.store(now, Ordering::SeqCst);
	}
}

/// SystemClock is a clock that uses the system time.
#[derive(Clone, Copy, Default)]
#[non_exhaustive]
pub struct SystemClock;

impl SystemClock {
	pub fn now(&self) -> u64 {
		match SystemTime::now().duration_since(UNIX_EPOCH) {
			Ok(duration) => duration.as_millis() as u64,
			Err(error) => panic!("Clock may have gone backwards: {:?}", error.duration()),
		}
	}
}
