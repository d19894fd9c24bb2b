//! Worker side of a supervisor/worker process pair.
//!
//! A worker is spawned by a parent supervisor and talks to it over one
//! envelope channel. This crate provides:
//!
//! - the lifecycle handshake (`ready`, `sync`, `close`) with a bounded,
//!   exit-code-aware shutdown,
//! - request/reply correlation with per-request timeouts,
//! - structured error reporting to the parent,
//! - the application operations (device state, data, logs).
//!
//! Construct a [`Worker`] with [`Worker::connect`] or [`Worker::from_stream`],
//! register handlers, then drive the returned [`WorkerRuntime`] to completion
//! and exit with [`ShutdownOutcome::exit_code`].

mod channel;
mod config;
mod correlation;
mod error;
mod events;
mod funnel;
mod lifecycle;
mod signal;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{MessageChannel, SendCompletion};
pub use config::{
    WorkerConfig, DEFAULT_EXIT_FLUSH_GRACE, DEFAULT_FORCED_EXIT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use correlation::{CorrelationBus, CorrelationId, PendingReply};
pub use error::{Result, ValidationError, WorkerError};
pub use events::{Emission, EventRegistry, LifecycleEvent, ListenerId};
pub use funnel::{ErrorReport, ExceptionFunnel};
pub use lifecycle::{
    LifecycleController, LifecycleState, ShutdownCause, ShutdownOutcome, EXIT_CLEAN, EXIT_CRASH,
};
pub use worker::{Worker, WorkerRuntime};

// Handler panics are caught and reported, so a poisoned lock carries no
// broken invariant worth propagating.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
