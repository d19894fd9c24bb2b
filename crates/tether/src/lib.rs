//! Worker runtime for processes supervised over an IPC channel.
//!
//! A parent supervisor spawns the worker and exchanges newline-delimited JSON
//! envelopes with it: a `ready`/`close` lifecycle handshake, correlated
//! requests answered by id, and fire-and-forget device data, state, logs and
//! error reports.
//!
//! # Crate Structure
//!
//! - [`transport`]: Parent channel discovery and connection (Unix sockets, inherited descriptors)
//! - [`frame`]: Envelope type and newline-delimited JSON codec
//! - [`worker`]: Lifecycle, correlation, and the application-facing [`Worker`]

/// Re-export transport types.
pub mod transport {
    pub use tether_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tether_frame::*;
}

/// Re-export worker types.
pub mod worker {
    pub use tether_worker::*;
}

pub use tether_worker::{ShutdownOutcome, Worker, WorkerConfig, WorkerRuntime};
