use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;

#[test]
fn executes_posted_work() {
	let runner = TaskRunner::new("test");
	let ran = Arc::new(AtomicBool::new(false));
	let flag = ran.clone();
	let handle = runner.post(move || flag.store(true, Ordering::SeqCst)).unwrap();
	handle.wait_finished();
	assert!(ran.load(Ordering::SeqCst));
	assert_eq!(handle.phase(), TaskPhase::Finished);
	assert!(handle.is_finished());
}

#[test]
fn delayed_task_does_not_run_early() {
	let runner = TaskRunner::new("test");
	let started = Instant::now();
	let ran_after = Arc::new(Mutex::new(None));
	let slot = ran_after.clone();
	let handle = runner
		.post_delayed(move || *slot.lock() = Some(started.elapsed()), Duration::from_millis(80))
		.unwrap();
	handle.wait_finished();
	let elapsed = ran_after.lock().expect("task should have run");
	assert!(elapsed >= Duration::from_millis(80), "ran after {elapsed:?}");
}

#[test]
fn due_tasks_run_by_priority_then_post_order() {
	let runner = TaskRunner::new("test");
	let (gate_tx, gate_rx) = mpsc::channel::<()>();
	let blocker = runner.post(move || gate_rx.recv().unwrap()).unwrap();
	// the single worker must be busy before the rest is scheduled
	while blocker.phase() != TaskPhase::Running {
		thread::yield_now();
	}

	let order = Arc::new(Mutex::new(Vec::new()));
	let mut handles = Vec::new();
	for (tag, priority) in [("low", -1), ("first-high", 5), ("second-high", 5)] {
		let order = order.clone();
		handles.push(
			runner
				.post_prioritized(move || order.lock().push(tag), Duration::ZERO, priority)
				.unwrap(),
		);
	}
	assert_eq!(runner.pending_count(), 3);
	gate_tx.send(()).unwrap();
	for handle in &handles {
		handle.wait_finished();
	}
	blocker.wait_finished();
	assert_eq!(*order.lock(), vec!["first-high", "second-high", "low"]);
}

#[test]
fn cancel_before_start_prevents_execution() {
	let runner = TaskRunner::new("test");
	let (gate_tx, gate_rx) = mpsc::channel::<()>();
	let blocker = runner.post(move || gate_rx.recv().unwrap()).unwrap();
	while blocker.phase() != TaskPhase::Running {
		thread::yield_now();
	}

	let ran = Arc::new(AtomicBool::new(false));
	let flag = ran.clone();
	let pending = runner.post(move || flag.store(true, Ordering::SeqCst)).unwrap();
	assert!(pending.cancel());
	assert_eq!(pending.phase(), TaskPhase::Cancelled);
	gate_tx.send(()).unwrap();
	blocker.wait_finished();
	pending.wait_finished();
	assert!(!ran.load(Ordering::SeqCst));
	assert!(!pending.cancel(), "second cancel reports false");
}

#[test]
fn cancel_after_completion_returns_false() {
	let runner = TaskRunner::new("test");
	let handle = runner.post(|| {}).unwrap();
	handle.wait_finished();
	assert!(!handle.cancel());
	assert_eq!(handle.phase(), TaskPhase::Finished);
}

#[test]
fn panicking_task_leaves_the_worker_alive() {
	let runner = TaskRunner::new("test");
	let boom = runner.post(|| panic!("task boom")).unwrap();
	boom.wait_finished();
	assert_eq!(boom.phase(), TaskPhase::Finished);

	let ran = Arc::new(AtomicBool::new(false));
	let flag = ran.clone();
	let next = runner.post(move || flag.store(true, Ordering::SeqCst)).unwrap();
	next.wait_finished();
	assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn stop_cancels_pending_and_rejects_posts() {
	let runner = TaskRunner::new("test");
	let (gate_tx, gate_rx) = mpsc::channel::<()>();
	let blocker = runner.post(move || gate_rx.recv().unwrap()).unwrap();
	while blocker.phase() != TaskPhase::Running {
		thread::yield_now();
	}

	let pending = runner.post(|| {}).unwrap();
	runner.stop();
	assert_eq!(pending.phase(), TaskPhase::Cancelled);
	assert!(matches!(runner.post(|| {}), Err(RunnerStopped(_))));
	// the running task still completes
	gate_tx.send(()).unwrap();
	blocker.wait_finished();
	assert_eq!(blocker.phase(), TaskPhase::Finished);
}

#[test]
fn reschedule_moves_the_due_time() {
	let runner = TaskRunner::new("test");
	let handle = runner.post_delayed(|| {}, Duration::from_secs(600)).unwrap();
	assert!(handle.reschedule(Duration::ZERO));
	handle.wait_finished();
	assert_eq!(handle.phase(), TaskPhase::Finished);
	assert!(!handle.reschedule(Duration::ZERO), "finished task cannot be rescheduled");
}

#[test]
fn throughput_allows_parallel_workers() {
	let runner = TaskRunner::with_throughput("test", 2);
	assert_eq!(runner.throughput(), 2);
	let rendezvous = Arc::new(Barrier::new(2));
	let mut handles = Vec::new();
	for _ in 0..2 {
		let rendezvous = rendezvous.clone();
		// both tasks must run at once to get past the barrier
		handles.push(runner.post(move || { rendezvous.wait(); }).unwrap());
	}
	for handle in &handles {
		handle.wait_finished();
	}
}

#[test]
fn drop_cancels_pending_tasks() {
	let runner = TaskRunner::new("test");
	let (gate_tx, gate_rx) = mpsc::channel::<()>();
	let blocker = runner.post(move || gate_rx.recv().unwrap()).unwrap();
	while blocker.phase() != TaskPhase::Running {
		thread::yield_now();
	}
	let pending = runner.post(|| {}).unwrap();
	drop(runner);
	assert_eq!(pending.phase(), TaskPhase::Cancelled);
	gate_tx.send(()).unwrap();
	blocker.wait_finished();
}
