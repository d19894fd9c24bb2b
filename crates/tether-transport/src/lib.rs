//! Parent/child channel substrate for tether workers.
//!
//! A worker is either handed an already-connected socket descriptor by the
//! process that spawned it, or told where to connect. Either way it ends up
//! with an [`IpcStream`]: a plain async byte stream that the framing layer
//! sits on top of.

pub mod endpoint;
pub mod error;
pub mod stream;

pub use endpoint::{Endpoint, CHANNEL_FD_ENV, SOCKET_ENV};
pub use error::{Result, TransportError};
pub use stream::IpcStream;
