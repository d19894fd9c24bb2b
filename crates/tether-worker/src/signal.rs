//! Termination signal listener.

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Waits for a process termination request.
#[cfg(unix)]
pub(crate) struct TerminationSignals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    /// Register handlers for SIGHUP, SIGINT and SIGTERM.
    pub(crate) fn install() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolves with the signal's name when one arrives.
    pub(crate) async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.hangup.recv() => "SIGHUP",
            Some(()) = self.interrupt.recv() => "SIGINT",
            Some(()) = self.terminate.recv() => "SIGTERM",
            else => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    pub(crate) fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "CTRL_C",
            Err(_) => std::future::pending().await,
        }
    }
}
