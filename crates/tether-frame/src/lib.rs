//! Envelopes and framing for the parent/worker channel.
//!
//! Every message on the wire is an [`Envelope`], a `{"type": ..., "data": ...}`
//! JSON object terminated by a single `\n`. The type tag decides how the
//! payload is interpreted; a handful of tags are reserved for the lifecycle
//! handshake, everything else is application traffic.

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::{EnvelopeCodec, FrameConfig, DEFAULT_MAX_FRAME_LENGTH};
pub use envelope::{
    Envelope, Inbound, CLOSE, DATA, ERROR, LOG, READY, REQUEST_DEVICE_INFO,
    SET_DEVICE_STATE, SYNC,
};
pub use error::{FrameError, Result};
