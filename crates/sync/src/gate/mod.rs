//! Reentrant read/write gate.
//!
//! This module provides [`ReentrantGate`], a blocking many-readers /
//! one-writer gate for serializing access to shared platform state.
//!
//! # Design
//!
//! - A thread already holding the gate reenters any compatible mode without
//!   blocking, and an exclusive holder may always also read.
//! - A sole reader upgrades to writer in place; its shared count is stashed
//!   and restored when the exclusive count returns to zero, downgrading the
//!   grant back to shared. A reader among other readers requesting exclusive
//!   queues instead, which can self-deadlock; the opt-in detector in
//!   [`GateConfig`] is the only remedy.
//! - Waiters park on their own wait cell (one mutex/condvar pair each) so a
//!   releaser wakes exactly the cells it selected, after installing their
//!   holds. The queue is ordered by caller-supplied priority. This is NOT a
//!   fairness guarantee: an arriving reader is admitted whenever the grant
//!   is shared, so a continuous reader stream can starve a queued writer.
//! - Actions posted with [`ReentrantGate::post_write`] / `post_read` run
//!   immediately when possible, otherwise on whichever thread releases the
//!   gate to the free state.

use std::any::Any;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use smallvec::SmallVec;

use crate::config::GateConfig;
use crate::error::DeadlockError;

mod state;

pub use state::GateMode;
use state::{DeferredAction, GateState, ThreadHold, WaitCell};

/// Reentrant many-readers / one-writer gate.
///
/// The gate guards no data of its own; callers use it to serialize access to
/// state they manage elsewhere. All bookkeeping lives in one per-instance
/// record behind an internal mutex.
pub struct ReentrantGate {
	state: parking_lot::Mutex<GateState>,
	config: GateConfig,
}

impl Default for ReentrantGate {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for ReentrantGate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReentrantGate")
			.field("granted", &self.granted_mode())
			.finish_non_exhaustive()
	}
}

impl ReentrantGate {
	/// Creates a gate with default options (deadlock detection off).
	pub fn new() -> Self {
		Self::with_config(GateConfig::default())
	}

	/// Creates a gate with explicit options.
	pub fn with_config(config: GateConfig) -> Self {
		Self {
			state: parking_lot::Mutex::new(GateState::new()),
			config,
		}
	}

	/// Acquires shared access, blocking until compatible.
	pub fn read(&self) -> ReadGuard<'_> {
		self.read_prioritized(0)
	}

	/// Acquires shared access with an explicit queue priority.
	///
	/// Higher priorities sort earlier in the waiter queue; ties keep
	/// insertion order. Priority affects queue position only, never an
	/// already-granted mode.
	pub fn read_prioritized(&self, priority: i32) -> ReadGuard<'_> {
		self.enter(GateMode::Shared, priority);
		ReadGuard {
			gate: self,
			_not_send: PhantomData,
		}
	}

	/// Acquires exclusive access, blocking until compatible.
	pub fn write(&self) -> WriteGuard<'_> {
		self.write_prioritized(0)
	}

	/// Acquires exclusive access with an explicit queue priority.
	pub fn write_prioritized(&self, priority: i32) -> WriteGuard<'_> {
		self.enter(GateMode::Exclusive, priority);
		WriteGuard {
			gate: self,
			_not_send: PhantomData,
		}
	}

	/// Runs `action` under shared access, releasing on all exit paths.
	///
	/// Fallible actions return `Result` through the closure; unwinds
	/// propagate after the hold is released.
	pub fn with_read<T>(&self, action: impl FnOnce() -> T) -> T {
		let _hold = self.read();
		action()
	}

	/// Runs `action` under exclusive access, releasing on all exit paths.
	pub fn with_write<T>(&self, action: impl FnOnce() -> T) -> T {
		let _hold = self.write();
		action()
	}

	/// Runs `action` under exclusive access now if the gate is free or the
	/// caller already holds exclusive; otherwise enqueues it to run on
	/// whichever thread releases the gate to the free state.
	///
	/// A deferred action that unwinds is caught and logged so the release
	/// cascade keeps draining.
	pub fn post_write<F>(&self, action: F)
	where
		F: FnOnce() + Send + 'static,
	{
		let me = thread::current().id();
		{
			let mut guard = self.state.lock();
			let st = &mut *guard;
			let immediate = match st.holders.get(&me) {
				Some(hold) => hold.exclusive > 0,
				None => GateMode::Exclusive.compatible_with(st.granted),
			};
			if !immediate {
				st.deferred_writes.push_back(Box::new(action));
				tracing::debug!(pending = st.deferred_writes.len(), "gate.defer_write");
				return;
			}
		}
		self.with_write(action);
	}

	/// Runs `action` under shared access now if the caller may enter read
	/// without blocking; otherwise enqueues it for the release-to-free edge.
	///
	/// Deferred reads drain before deferred writes.
	pub fn post_read<F>(&self, action: F)
	where
		F: FnOnce() + Send + 'static,
	{
		let me = thread::current().id();
		{
			let mut guard = self.state.lock();
			let st = &mut *guard;
			let immediate = st.holders.contains_key(&me) || GateMode::Shared.compatible_with(st.granted);
			if !immediate {
				st.deferred_reads.push_back(Box::new(action));
				tracing::debug!(pending = st.deferred_reads.len(), "gate.defer_read");
				return;
			}
		}
		self.with_read(action);
	}

	/// Strongest mode the calling thread currently holds.
	pub fn held_mode(&self) -> GateMode {
		let me = thread::current().id();
		self.state
			.lock()
			.holders
			.get(&me)
			.map(ThreadHold::strongest)
			.unwrap_or(GateMode::None)
	}

	/// True when the calling thread may read without blocking by virtue of
	/// an existing hold (shared or exclusive).
	pub fn holds_read(&self) -> bool {
		self.held_mode() != GateMode::None
	}

	/// True when the calling thread holds exclusive access.
	pub fn holds_write(&self) -> bool {
		self.held_mode() == GateMode::Exclusive
	}

	/// Snapshot of the currently granted mode.
	pub fn granted_mode(&self) -> GateMode {
		self.state.lock().granted
	}

	/// Blocks until `mode` can be granted to the calling thread.
	fn enter(&self, mode: GateMode, priority: i32) {
		debug_assert!(matches!(mode, GateMode::Shared | GateMode::Exclusive));
		let me = thread::current().id();
		let cell = {
			let mut guard = self.state.lock();
			let st = &mut *guard;
			if let Some(hold) = st.holders.get_mut(&me) {
				match mode {
					// a holder of either mode may always read
					GateMode::Shared => {
						if hold.shared == 0 {
							st.shared_holders += 1;
						}
						hold.shared += 1;
						return;
					}
					GateMode::Exclusive if hold.exclusive > 0 => {
						hold.exclusive += 1;
						return;
					}
					// sole reader: upgrade in place
					GateMode::Exclusive if st.shared_holders == 1 => {
						hold.shared_snapshot = hold.shared;
						hold.shared = 0;
						hold.exclusive = 1;
						st.shared_holders = 0;
						st.granted = GateMode::Exclusive;
						tracing::trace!(thread = ?me, "gate.upgrade");
						return;
					}
					// reader among other readers requesting exclusive:
					// queue, at the documented risk of self-deadlock
					GateMode::Exclusive => {}
					GateMode::None | GateMode::Chain => unreachable!(),
				}
			} else if mode.compatible_with(st.granted) {
				Self::install(st, me, mode);
				return;
			}
			let cell = WaitCell::new(mode, priority);
			st.enqueue_waiter(cell.clone());
			tracing::trace!(
				thread = ?me,
				requested = ?mode,
				granted = ?st.granted,
				queued = st.waiters.len(),
				"gate.queue"
			);
			cell
		};

		let probe = self
			.config
			.deadlock_detection
			.then_some(self.config.probe_interval);
		while !cell.park(probe) {
			let mut guard = self.state.lock();
			if guard.wait_cycle() {
				let holders = guard.holders.len();
				guard.waiters.retain(|w| !Arc::ptr_eq(w, &cell));
				drop(guard);
				tracing::warn!(holders, "gate.deadlock");
				panic::panic_any(DeadlockError { holders });
			}
		}
		// the releaser installed this thread's hold before waking it
	}

	/// Installs a fresh hold for `me`, setting the granted mode.
	fn install(st: &mut GateState, me: ThreadId, mode: GateMode) {
		let hold = match mode {
			GateMode::Shared => {
				st.shared_holders += 1;
				ThreadHold {
					shared: 1,
					..ThreadHold::default()
				}
			}
			GateMode::Exclusive => ThreadHold {
				exclusive: 1,
				..ThreadHold::default()
			},
			GateMode::None | GateMode::Chain => unreachable!(),
		};
		st.holders.insert(me, hold);
		st.granted = mode;
		tracing::trace!(thread = ?me, granted = ?st.granted, "gate.enter");
	}

	/// Releases one reentry of `mode` for the calling thread, then keeps
	/// draining deferred actions for as long as each drain frees the gate
	/// again.
	///
	/// Panics when the thread does not hold `mode`: that is a caller bug and
	/// the bookkeeping can no longer be trusted.
	fn exit(&self, mut mode: GateMode) {
		loop {
			match self.release_one(mode) {
				ReleaseOutcome::Done => return,
				ReleaseOutcome::Wake(batch) => {
					for cell in &batch {
						tracing::trace!(thread = ?cell.thread, mode = ?cell.mode, "gate.wake");
						cell.wake();
					}
					return;
				}
				ReleaseOutcome::Deferred(action, granted) => {
					tracing::debug!(mode = ?granted, "gate.drain");
					if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(action)) {
						tracing::warn!(cause = panic_message(&payload), "deferred gate action panicked");
					}
					mode = granted;
				}
			}
		}
	}

	/// One bookkeeping step of [`Self::exit`], under the state lock.
	fn release_one(&self, mode: GateMode) -> ReleaseOutcome {
		let me = thread::current().id();
		{
			let mut guard = self.state.lock();
			let st = &mut *guard;
			let Some(hold) = st.holders.get_mut(&me) else {
				panic!("gate: released {mode:?} access the thread does not hold");
			};
			match mode {
				GateMode::Shared => {
					if hold.shared > 0 {
						hold.shared -= 1;
						if hold.shared == 0 {
							st.shared_holders -= 1;
						}
					} else if hold.shared_snapshot > 0 {
						// read hold released out of order inside an
						// upgrade window
						hold.shared_snapshot -= 1;
					} else {
						panic!("gate: released shared access the thread does not hold");
					}
				}
				GateMode::Exclusive => {
					if hold.exclusive == 0 {
						panic!("gate: released exclusive access the thread does not hold");
					}
					hold.exclusive -= 1;
					if hold.exclusive == 0 {
						if hold.shared_snapshot > 0 {
							if hold.shared == 0 {
								st.shared_holders += 1;
							}
							hold.shared += hold.shared_snapshot;
							hold.shared_snapshot = 0;
							st.granted = GateMode::Shared;
							tracing::trace!(thread = ?me, "gate.downgrade");
						} else if hold.shared > 0 {
							st.granted = GateMode::Shared;
							tracing::trace!(thread = ?me, "gate.downgrade");
						}
					}
				}
				GateMode::None | GateMode::Chain => unreachable!(),
			}
			if st.holders.get(&me).is_some_and(ThreadHold::is_empty) {
				st.holders.remove(&me);
			}
			if !st.holders.is_empty() {
				return ReleaseOutcome::Done;
			}
			// release-to-free edge: deferred actions drain first, then the
			// head of the waiter queue is woken
			if let Some(action) = st.deferred_reads.pop_front() {
				Self::install(st, me, GateMode::Shared);
				ReleaseOutcome::Deferred(action, GateMode::Shared)
			} else if let Some(action) = st.deferred_writes.pop_front() {
				Self::install(st, me, GateMode::Exclusive);
				ReleaseOutcome::Deferred(action, GateMode::Exclusive)
			} else if st.waiters.is_empty() {
				st.granted = GateMode::None;
				ReleaseOutcome::Done
			} else {
				// hand-off: holds are installed for the whole batch before
				// any cell is signaled, so a woken waiter that finishes
				// fast cannot trigger a second hand-off under the feet of
				// a slower batch member
				st.granted = GateMode::Chain;
				let batch = Self::pop_wake_batch(st);
				for cell in &batch {
					Self::install(st, cell.thread, cell.mode);
				}
				ReleaseOutcome::Wake(batch)
			}
		}
	}

	/// Pops the head waiter plus, for a shared head, the contiguous run of
	/// shared waiters behind it.
	fn pop_wake_batch(st: &mut GateState) -> SmallVec<[Arc<WaitCell>; 4]> {
		let mut batch = SmallVec::new();
		let Some(head) = st.waiters.pop_front() else {
			return batch;
		};
		let shared_head = head.mode == GateMode::Shared;
		batch.push(head);
		if shared_head {
			while st.waiters.front().is_some_and(|w| w.mode == GateMode::Shared) {
				if let Some(next) = st.waiters.pop_front() {
					batch.push(next);
				}
			}
		}
		batch
	}
}

/// What an exit step leaves for the caller to do outside the state lock.
enum ReleaseOutcome {
	/// Nothing: the gate is still held, or now free with no pending work.
	Done,
	/// Signal these pre-installed waiters.
	Wake(SmallVec<[Arc<WaitCell>; 4]>),
	/// Run this deferred action under the just-granted mode, then release it.
	Deferred(DeferredAction, GateMode),
}

/// Extracts a printable message from an unwind payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&'static str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("non-string panic payload")
}

/// Shared hold on a [`ReentrantGate`]; dropping releases one reentry.
#[must_use = "the gate is released when the guard is dropped"]
pub struct ReadGuard<'a> {
	gate: &'a ReentrantGate,
	// holds are thread-identity-based; the guard must not change threads
	_not_send: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
	fn drop(&mut self) {
		self.gate.exit(GateMode::Shared);
	}
}

impl std::fmt::Debug for ReadGuard<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReadGuard").finish_non_exhaustive()
	}
}

/// Exclusive hold on a [`ReentrantGate`]; dropping releases one reentry.
#[must_use = "the gate is released when the guard is dropped"]
pub struct WriteGuard<'a> {
	gate: &'a ReentrantGate,
	_not_send: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
	fn drop(&mut self) {
		self.gate.exit(GateMode::Exclusive);
	}
}

impl std::fmt::Debug for WriteGuard<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WriteGuard").finish_non_exhaustive()
	}
}
