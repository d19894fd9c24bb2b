use std::time::Duration;

/// Local validation failures. These are returned to the caller and never
/// transmitted to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Missing or blank device/subject identifier.
    #[error("a valid client/device identifier is required")]
    SubjectId,

    /// Missing or blank data payload.
    #[error("a valid data is required")]
    Data,

    /// Missing or blank log line.
    #[error("a valid log data is required")]
    LogData,

    /// Error report without a name or message.
    #[error("a valid error object is required")]
    ErrorReport,
}

/// Errors that can occur in worker operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] tether_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] tether_frame::FrameError),

    /// The request was rejected before anything was sent.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The outbound writer is gone; nothing more can be delivered.
    #[error("parent channel closed")]
    ChannelClosed,

    /// No reply arrived for a correlated request in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A correlated request could not be delivered to the parent.
    #[error("request not delivered: {0}")]
    Undelivered(String),

    /// The worker terminated while the operation was outstanding.
    #[error("worker shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, WorkerError>;
