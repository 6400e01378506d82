use std::time::Duration;

/// Construction-time options for a [`ReentrantGate`](crate::ReentrantGate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
	/// Scan for self-referential wait cycles while parked instead of
	/// blocking forever. A detected cycle aborts the acquisition with
	/// [`DeadlockError`](crate::DeadlockError).
	pub deadlock_detection: bool,
	/// How often a parked waiter wakes to run the cycle scan. Only
	/// meaningful when `deadlock_detection` is on.
	pub probe_interval: Duration,
}

impl Default for GateConfig {
	fn default() -> Self {
		Self {
			deadlock_detection: false,
			probe_interval: Duration::from_millis(100),
		}
	}
}
