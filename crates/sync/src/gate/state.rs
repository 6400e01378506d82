use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

/// Access mode granted on the gate, or requested by a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
	/// No thread holds the gate.
	None,
	/// Hand-off in progress: woken waiters are installing themselves.
	/// Compatible with nothing, so late arrivals queue behind the wake-up.
	Chain,
	/// One or more threads hold shared access.
	Shared,
	/// Exactly one thread holds exclusive access.
	Exclusive,
}

impl GateMode {
	/// Returns true when a request for `self` may be granted under `granted`.
	pub(crate) fn compatible_with(self, granted: GateMode) -> bool {
		match self {
			GateMode::Shared => matches!(granted, GateMode::None | GateMode::Shared),
			GateMode::Exclusive => granted == GateMode::None,
			GateMode::None | GateMode::Chain => false,
		}
	}
}

/// Per-thread reentry bookkeeping.
///
/// `shared_snapshot` stashes the shared count while a sole reader holds the
/// gate upgraded to exclusive; it is restored when the exclusive count
/// returns to zero, downgrading the grant back to shared.
#[derive(Debug, Default)]
pub(crate) struct ThreadHold {
	pub shared: u32,
	pub exclusive: u32,
	pub shared_snapshot: u32,
}

impl ThreadHold {
	pub fn is_empty(&self) -> bool {
		self.shared == 0 && self.exclusive == 0 && self.shared_snapshot == 0
	}

	/// Strongest mode this thread currently holds.
	pub fn strongest(&self) -> GateMode {
		if self.exclusive > 0 {
			GateMode::Exclusive
		} else if self.shared > 0 {
			GateMode::Shared
		} else {
			GateMode::None
		}
	}
}

/// One queued acquisition request with its own wake signal.
///
/// Each cell is its own mutex/condvar pair so the releaser can wake exactly
/// the waiters it selected, not a whole shared condition.
pub(crate) struct WaitCell {
	pub mode: GateMode,
	pub thread: ThreadId,
	pub priority: i32,
	woken: Mutex<bool>,
	signal: Condvar,
}

impl WaitCell {
	pub fn new(mode: GateMode, priority: i32) -> Arc<Self> {
		Arc::new(Self {
			mode,
			thread: thread::current().id(),
			priority,
			woken: Mutex::new(false),
			signal: Condvar::new(),
		})
	}

	/// Marks the cell woken and signals its parked thread.
	pub fn wake(&self) {
		let mut woken = self.woken.lock();
		*woken = true;
		self.signal.notify_one();
	}

	/// Parks the calling thread until woken.
	///
	/// With a probe interval set, returns `false` on a timeout that found
	/// the cell still unwoken so the caller can run its deadlock scan.
	pub fn park(&self, probe: Option<Duration>) -> bool {
		let mut woken = self.woken.lock();
		while !*woken {
			match probe {
				Some(interval) => {
					if self.signal.wait_for(&mut woken, interval).timed_out() && !*woken {
						return false;
					}
				}
				None => self.signal.wait(&mut woken),
			}
		}
		true
	}
}

/// Action deferred until the gate releases to the free state.
pub(crate) type DeferredAction = Box<dyn FnOnce() + Send + 'static>;

/// Shared bookkeeping for one gate instance.
///
/// Owned by the gate and protected by one internal mutex; never a global.
pub(crate) struct GateState {
	pub granted: GateMode,
	pub holders: FxHashMap<ThreadId, ThreadHold>,
	/// Number of distinct threads with a nonzero shared count.
	pub shared_holders: usize,
	/// Waiters ordered by descending priority; ties keep insertion order.
	pub waiters: VecDeque<Arc<WaitCell>>,
	pub deferred_reads: VecDeque<DeferredAction>,
	pub deferred_writes: VecDeque<DeferredAction>,
}

impl GateState {
	pub fn new() -> Self {
		Self {
			granted: GateMode::None,
			holders: FxHashMap::default(),
			shared_holders: 0,
			waiters: VecDeque::new(),
			deferred_reads: VecDeque::new(),
			deferred_writes: VecDeque::new(),
		}
	}

	/// Inserts `cell` keeping the queue sorted by descending priority.
	pub fn enqueue_waiter(&mut self, cell: Arc<WaitCell>) {
		let at = self
			.waiters
			.iter()
			.position(|w| w.priority < cell.priority)
			.unwrap_or(self.waiters.len());
		self.waiters.insert(at, cell);
	}

	/// True when every current holder is itself parked in the waiter queue,
	/// meaning no release can ever happen.
	pub fn wait_cycle(&self) -> bool {
		!self.holders.is_empty()
			&& self
				.holders
				.keys()
				.all(|t| self.waiters.iter().any(|w| w.thread == *t))
	}
}
