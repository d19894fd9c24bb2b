use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransportError};

/// Environment variable naming a Unix socket path to connect to.
pub const SOCKET_ENV: &str = "TETHER_SOCKET";

/// Environment variable carrying an inherited, already-connected descriptor.
///
/// This is the variable Node-style `fork()` parents export for their IPC
/// channel, so a tether worker can be spawned by such a parent unchanged.
pub const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

/// Where the parent channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Connect to a listening Unix domain socket.
    Socket(PathBuf),
    /// Adopt a socket descriptor inherited from the parent process.
    Descriptor(i32),
}

impl Endpoint {
    /// Resolve the endpoint from the process environment.
    ///
    /// An explicit socket path wins over an inherited descriptor.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var(SOCKET_ENV).ok(),
            std::env::var(CHANNEL_FD_ENV).ok(),
        )
    }

    /// Resolve the endpoint from raw variable values.
    pub fn from_vars(socket: Option<String>, descriptor: Option<String>) -> Result<Self> {
        if let Some(path) = socket.filter(|p| !p.trim().is_empty()) {
            return Ok(Self::Socket(PathBuf::from(path)));
        }

        match descriptor {
            Some(raw) => parse_descriptor(&raw).map(Self::Descriptor),
            None => Err(TransportError::MissingEndpoint {
                socket_var: SOCKET_ENV,
                fd_var: CHANNEL_FD_ENV,
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(path) => write!(f, "unix:{}", path.display()),
            Self::Descriptor(fd) => write!(f, "fd:{fd}"),
        }
    }
}

fn parse_descriptor(raw: &str) -> Result<i32> {
    let invalid = |reason: &str| TransportError::InvalidDescriptor {
        var: CHANNEL_FD_ENV,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let fd: i32 = raw.trim().parse().map_err(|_| invalid("not an integer"))?;
    if fd < 0 {
        return Err(invalid("descriptor must be non-negative"));
    }
    Ok(fd)
}
