//! Reentrant read/write gate for serializing access to shared platform state.
//!
//! [`ReentrantGate`] admits many concurrent readers or one exclusive writer.
//! A thread already holding the gate may reenter in any compatible mode, a
//! writer may always also read, and a lone reader may upgrade to writer.
//! Deferred actions posted with [`ReentrantGate::post_write`] run once the
//! gate frees up.

mod config;
mod error;
mod gate;

pub use config::GateConfig;
pub use error::DeadlockError;
pub use gate::{GateMode, ReadGuard, ReentrantGate, WriteGuard};
