//! Fatal-exit hooks used when startup warm-up hits a credential that can never work.

// self
use crate::{_prelude::*, obs};

/// Host-provided reaction to an unrecoverable warm-up failure.
///
/// The broker calls [`FatalSignal::trigger`] and then returns the error to its caller, so
/// implementations that do not terminate the process still observe a regular failure.
pub trait FatalSignal
where
	Self: Send + Sync,
{
	/// Signals that `error` makes the service unable to run.
	fn trigger(&self, error: &Error);
}

/// Terminates the process with a fixed exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
	/// Exit code passed to [`std::process::exit`].
	pub code: i32,
}
impl Default for ProcessExit {
	fn default() -> Self {
		Self { code: 1 }
	}
}
impl FatalSignal for ProcessExit {
	fn trigger(&self, error: &Error) {
		obs::log_fatal(error);

		std::process::exit(self.code);
	}
}

/// Records the first fatal error instead of exiting; suited for supervisors and tests.
#[derive(Debug, Default)]
pub struct FatalLatch(Mutex<Option<Error>>);
impl FatalLatch {
	/// Creates an untriggered latch.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns `true` once any error has been recorded.
	pub fn is_triggered(&self) -> bool {
		self.0.lock().is_some()
	}

	/// Takes the recorded error, re-arming the latch.
	pub fn take(&self) -> Option<Error> {
		self.0.lock().take()
	}
}
impl FatalSignal for FatalLatch {
	fn trigger(&self, error: &Error) {
		obs::log_fatal(error);

		let mut slot = self.0.lock();

		if slot.is_none() {
			*slot = Some(error.clone());
		}
	}
}
