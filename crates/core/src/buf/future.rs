use crate::err::Error;
use std::sync::{Condvar, Mutex};

/// The lifecycle of a single-shot buffer I/O future.
///
/// Every suspension point in the buffer manager corresponds to one submitted
/// I/O request; the future advances `SUBMITTED → POLLING → COMPLETED` and a
/// dropped future moves to `ABANDONED` so the completion side can recycle
/// the result instead of delivering it.
enum FutureState<T> {
	Submitted,
	Polling,
	Completed(T),
	Abandoned,
	/// The result was handed to exactly one caller
	Taken,
}

/// A one-shot rendezvous between an I/O completion and a single waiter.
///
/// `set_result_and_continue` and the consuming side synchronize on the same
/// mutex, so a waiter is never resumed concurrently with the result being
/// set. The result is handed out at most once; a second take surfaces
/// [`Error::CoroutineContinuedWithoutResult`].
pub(crate) struct SingleShot<T> {
	state: Mutex<FutureState<T>>,
	cond: Condvar,
}

impl<T> SingleShot<T> {
	pub fn new() -> Self {
		SingleShot {
			state: Mutex::new(FutureState::Submitted),
			cond: Condvar::new(),
		}
	}

	/// Delivers the result and wakes the waiter.
	///
	/// Returns the value back to the caller when the future was abandoned
	/// or already completed, so the completion side can recycle it.
	pub fn set_result_and_continue(&self, value: T) -> Option<T> {
		let mut state = self.state.lock().expect("unreachable: future mutex poisoned");
		match &*state {
			FutureState::Submitted | FutureState::Polling => {
				*state = FutureState::Completed(value);
				self.cond.notify_all();
				None
			}
			FutureState::Abandoned | FutureState::Completed(_) | FutureState::Taken => Some(value),
		}
	}

	/// Checks once for a result without blocking
	pub fn poll_once(&self) -> Result<Option<T>, Error> {
		let mut state = self.state.lock().expect("unreachable: future mutex poisoned");
		match std::mem::replace(&mut *state, FutureState::Polling) {
			FutureState::Completed(value) => {
				*state = FutureState::Taken;
				Ok(Some(value))
			}
			FutureState::Submitted | FutureState::Polling => Ok(None),
			FutureState::Abandoned => {
				*state = FutureState::Abandoned;
				Ok(None)
			}
			FutureState::Taken => {
				*state = FutureState::Taken;
				Err(Error::CoroutineContinuedWithoutResult)
			}
		}
	}

	/// Blocks until the result is delivered
	pub fn wait_once(&self) -> Result<T, Error> {
		let mut state = self.state.lock().expect("unreachable: future mutex poisoned");
		loop {
			match std::mem::replace(&mut *state, FutureState::Polling) {
				FutureState::Completed(value) => {
					*state = FutureState::Taken;
					return Ok(value);
				}
				FutureState::Taken => {
					*state = FutureState::Taken;
					return Err(Error::CoroutineContinuedWithoutResult);
				}
				FutureState::Abandoned => {
					*state = FutureState::Abandoned;
					return Err(Error::CoroutineContinuedWithoutResult);
				}
				FutureState::Submitted | FutureState::Polling => {
					state = self
						.cond
						.wait(state)
						.expect("unreachable: future mutex poisoned");
				}
			}
		}
	}

	/// Marks the future as no longer awaited.
	///
	/// A result that already arrived is returned for recycling; a result
	/// arriving later is handed back to the completion side instead.
	pub fn abandon(&self) -> Option<T> {
		let mut state = self.state.lock().expect("unreachable: future mutex poisoned");
		match std::mem::replace(&mut *state, FutureState::Abandoned) {
			FutureState::Completed(value) => Some(value),
			_ => None,
		}
	}
}
