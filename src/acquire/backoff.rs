//! Capped exponential backoff used by warm-up acquisition.

// crates.io
use backon::ExponentialBuilder;
// self
use crate::_prelude::*;

/// Delay schedule between failed backoff-mode attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
	/// Total attempts before giving up.
	pub max_attempts: u32,
	/// Delay after the first failure.
	pub min_delay: Duration,
	/// Upper bound for any single delay.
	pub max_delay: Duration,
	/// Growth factor applied per failure.
	pub factor: f32,
	/// Adds a random share of the current delay to each wait.
	pub jitter: bool,
}
impl BackoffPolicy {
	/// Number of waits between attempts (`max_attempts - 1`).
	pub fn max_retries(&self) -> usize {
		usize::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX)
	}

	/// Builds the `backon` schedule for this policy.
	pub fn builder(&self) -> ExponentialBuilder {
		let builder = ExponentialBuilder::default()
			.with_min_delay(self.min_delay)
			.with_max_delay(self.max_delay)
			.with_factor(self.factor)
			.with_max_times(self.max_retries());

		if self.jitter { builder.with_jitter() } else { builder }
	}
}
impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 300,
			min_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
			factor: 2.0,
			jitter: true,
		}
	}
}
