//! Worker-thread pool draining a schedule of posted tasks.
//!
//! A [`TaskRunner`] owns a named pool of OS worker threads. Posted closures
//! carry a due instant and a priority: workers pick the highest-priority due
//! task, ties in posting order, and park with a deadline when nothing is due
//! yet. A task that unwinds is caught and logged; it never takes the worker
//! down with it.

use std::any::Any;
use std::panic;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::task::{TaskCore, TaskPhase};

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Post rejected because the runner was stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task runner \"{0}\" is stopped")]
pub struct RunnerStopped(pub String);

/// One scheduled cell: when to run, in what order, and the work itself.
struct TaskEntry {
	id: u64,
	due: Instant,
	priority: i32,
	seq: u64,
	work: TaskFn,
	core: Arc<TaskCore>,
}

struct RunnerInner {
	queue: Vec<TaskEntry>,
	next_id: u64,
	next_seq: u64,
	stopped: bool,
}

struct RunnerShared {
	name: String,
	inner: Mutex<RunnerInner>,
	work: Condvar,
}

/// What a worker should do after scanning the schedule.
enum Next {
	Run(TaskEntry),
	Sleep(Instant),
	Park,
}

/// Named pool of worker threads executing posted tasks by due time and
/// priority.
pub struct TaskRunner {
	shared: Arc<RunnerShared>,
	throughput: usize,
}

impl TaskRunner {
	/// Creates a runner with a single worker thread.
	pub fn new(name: impl Into<String>) -> Self {
		Self::with_throughput(name, 1)
	}

	/// Creates a runner with up to `throughput` parallel workers.
	pub fn with_throughput(name: impl Into<String>, throughput: usize) -> Self {
		let name = name.into();
		let throughput = throughput.max(1);
		let shared = Arc::new(RunnerShared {
			name: name.clone(),
			inner: Mutex::new(RunnerInner {
				queue: Vec::new(),
				next_id: 1,
				next_seq: 0,
				stopped: false,
			}),
			work: Condvar::new(),
		});
		for index in 0..throughput {
			let worker = shared.clone();
			thread::Builder::new()
				.name(format!("{name}-{index}"))
				.spawn(move || worker_loop(&worker))
				.expect("failed to spawn task runner worker thread");
		}
		Self { shared, throughput }
	}

	/// Returns the runner name used for worker thread names.
	pub fn name(&self) -> &str {
		&self.shared.name
	}

	/// Maximum number of tasks this runner executes in parallel.
	pub fn throughput(&self) -> usize {
		self.throughput
	}

	/// Number of tasks waiting to run.
	pub fn pending_count(&self) -> usize {
		self.shared.inner.lock().queue.len()
	}

	/// Posts `work` to run as soon as a worker is free.
	pub fn post<F>(&self, work: F) -> Result<TaskHandle, RunnerStopped>
	where
		F: FnOnce() + Send + 'static,
	{
		self.post_prioritized(work, Duration::ZERO, 0)
	}

	/// Posts `work` to run no earlier than `delay` from now.
	pub fn post_delayed<F>(&self, work: F, delay: Duration) -> Result<TaskHandle, RunnerStopped>
	where
		F: FnOnce() + Send + 'static,
	{
		self.post_prioritized(work, delay, 0)
	}

	/// Posts `work` with an explicit delay and priority.
	///
	/// Priority orders due tasks only; it never preempts a running one.
	pub fn post_prioritized<F>(&self, work: F, delay: Duration, priority: i32) -> Result<TaskHandle, RunnerStopped>
	where
		F: FnOnce() + Send + 'static,
	{
		let core = TaskCore::new();
		let id = {
			let mut inner = self.shared.inner.lock();
			if inner.stopped {
				return Err(RunnerStopped(self.shared.name.clone()));
			}
			let id = inner.next_id;
			inner.next_id += 1;
			let seq = inner.next_seq;
			inner.next_seq += 1;
			inner.queue.push(TaskEntry {
				id,
				due: Instant::now() + delay,
				priority,
				seq,
				work: Box::new(work),
				core: core.clone(),
			});
			id
		};
		self.shared.work.notify_one();
		tracing::trace!(runner = %self.shared.name, task = id, "runner.post");
		Ok(TaskHandle {
			id,
			core,
			shared: Arc::downgrade(&self.shared),
		})
	}

	/// Stops the runner: rejects further posts, cancels pending tasks, and
	/// lets workers exit. Tasks already running complete. Idempotent.
	pub fn stop(&self) {
		let drained = {
			let mut inner = self.shared.inner.lock();
			if inner.stopped {
				return;
			}
			inner.stopped = true;
			std::mem::take(&mut inner.queue)
		};
		self.shared.work.notify_all();
		for entry in &drained {
			entry.core.set_phase(TaskPhase::Cancelled);
		}
		tracing::debug!(runner = %self.shared.name, cancelled = drained.len(), "runner.stop");
	}
}

impl Drop for TaskRunner {
	fn drop(&mut self) {
		self.stop();
	}
}

impl std::fmt::Debug for TaskRunner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TaskRunner")
			.field("name", &self.shared.name)
			.field("throughput", &self.throughput)
			.finish_non_exhaustive()
	}
}

/// Handle to one posted task.
#[derive(Debug)]
pub struct TaskHandle {
	id: u64,
	core: Arc<TaskCore>,
	shared: Weak<RunnerShared>,
}

impl TaskHandle {
	/// Removes the task before it starts.
	///
	/// Returns true when the task was still pending; false once it is
	/// running, finished, or already cancelled.
	pub fn cancel(&self) -> bool {
		let Some(shared) = self.shared.upgrade() else {
			return false;
		};
		let entry = {
			let mut inner = shared.inner.lock();
			let Some(at) = inner.queue.iter().position(|e| e.id == self.id) else {
				return false;
			};
			inner.queue.swap_remove(at)
		};
		entry.core.set_phase(TaskPhase::Cancelled);
		tracing::debug!(task = self.id, "runner.cancel");
		true
	}

	/// Moves the pending task's due time to `delay` from now.
	///
	/// Returns false once the task is no longer pending.
	pub fn reschedule(&self, delay: Duration) -> bool {
		let Some(shared) = self.shared.upgrade() else {
			return false;
		};
		{
			let mut inner = shared.inner.lock();
			let Some(entry) = inner.queue.iter_mut().find(|e| e.id == self.id) else {
				return false;
			};
			entry.due = Instant::now() + delay;
		}
		shared.work.notify_all();
		true
	}

	/// Current phase of the task.
	pub fn phase(&self) -> TaskPhase {
		self.core.phase()
	}

	/// True once the task ran or was cancelled.
	pub fn is_finished(&self) -> bool {
		self.core.phase().is_terminal()
	}

	/// Blocks until the task ran or was cancelled.
	pub fn wait_finished(&self) {
		self.core.wait_terminal();
	}
}

fn worker_loop(shared: &RunnerShared) {
	let mut inner = shared.inner.lock();
	loop {
		if inner.stopped {
			break;
		}
		match next_action(&mut inner) {
			Next::Run(entry) => {
				entry.core.set_phase(TaskPhase::Running);
				drop(inner);
				tracing::trace!(runner = %shared.name, task = entry.id, "runner.run");
				if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(entry.work)) {
					tracing::warn!(
						runner = %shared.name,
						task = entry.id,
						cause = panic_message(&payload),
						"posted task panicked"
					);
				}
				entry.core.set_phase(TaskPhase::Finished);
				inner = shared.inner.lock();
			}
			Next::Sleep(deadline) => {
				let _ = shared.work.wait_until(&mut inner, deadline);
			}
			Next::Park => {
				shared.work.wait(&mut inner);
			}
		}
	}
}

/// Scans the schedule for the best due task, or the deadline to sleep until.
fn next_action(inner: &mut RunnerInner) -> Next {
	let now = Instant::now();
	let mut best: Option<usize> = None;
	let mut earliest: Option<Instant> = None;
	for (at, entry) in inner.queue.iter().enumerate() {
		if entry.due <= now {
			let better = match best {
				None => true,
				Some(current) => {
					let current = &inner.queue[current];
					entry.priority > current.priority || (entry.priority == current.priority && entry.seq < current.seq)
				}
			};
			if better {
				best = Some(at);
			}
		} else {
			earliest = Some(earliest.map_or(entry.due, |e| e.min(entry.due)));
		}
	}
	match best {
		Some(at) => Next::Run(inner.queue.swap_remove(at)),
		None => match earliest {
			Some(deadline) => Next::Sleep(deadline),
			None => Next::Park,
		},
	}
}

/// Extracts a printable message from an unwind payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&'static str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("non-string panic payload")
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests;
