use thiserror::Error;

/// Raised (as a panic payload) when deadlock detection finds that every
/// current gate holder is itself parked in the waiter queue, so no release
/// can ever happen.
///
/// Fatal by convention: callers are not expected to catch this and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gate deadlock: all {holders} holder(s) are parked in the waiter queue")]
pub struct DeadlockError {
	/// Number of holder threads participating in the cycle.
	pub holders: usize,
}
