//! Deferred task execution on named worker-thread pools.
//!
//! [`TaskRunner`] runs posted closures either as soon as a worker is free or
//! after a caller-supplied delay; due tasks are ordered by priority, ties in
//! posting order. Every post returns a [`TaskHandle`] for cancellation,
//! rescheduling, and completion waits.

mod runner;
mod task;

pub use runner::{RunnerStopped, TaskHandle, TaskRunner};
pub use task::TaskPhase;
