use std::path::PathBuf;

/// Errors that can occur while establishing the parent channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to the specified socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An inherited descriptor could not be used as a channel.
    #[error("invalid channel descriptor in {var}={value}: {reason}")]
    InvalidDescriptor {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// Neither a socket path nor an inherited descriptor was provided.
    #[error("no parent channel configured (set {socket_var} or {fd_var})")]
    MissingEndpoint {
        socket_var: &'static str,
        fd_var: &'static str,
    },

    /// The endpoint kind is not available on this platform.
    #[error("unsupported endpoint: {0}")]
    Unsupported(String),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
