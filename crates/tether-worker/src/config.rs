use std::time::Duration;

use tether_frame::{FrameConfig, DEFAULT_MAX_FRAME_LENGTH};

/// Default time a correlated request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default bound between shutdown initiation and termination.
pub const DEFAULT_FORCED_EXIT_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Default share of the forced-exit window reserved for draining queued envelopes.
pub const DEFAULT_EXIT_FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Worker behavior configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a correlated request stays bound before it is dropped.
    pub request_timeout: Duration,
    /// Upper bound on shutdown, measured from the first shutdown trigger.
    pub forced_exit_timeout: Duration,
    /// Tail of the forced-exit window spent flushing queued envelopes.
    /// Clamped to `forced_exit_timeout`.
    pub exit_flush_grace: Duration,
    /// Maximum inbound frame length.
    pub max_frame_length: usize,
    /// Install SIGHUP/SIGINT/SIGTERM handlers when the runtime starts.
    pub handle_signals: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            forced_exit_timeout: DEFAULT_FORCED_EXIT_TIMEOUT,
            exit_flush_grace: DEFAULT_EXIT_FLUSH_GRACE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handle_signals: true,
        }
    }
}

impl WorkerConfig {
    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_length: self.max_frame_length,
        }
    }

    /// Grace window, never longer than the forced-exit window itself.
    pub(crate) fn flush_grace(&self) -> Duration {
        self.exit_flush_grace.min(self.forced_exit_timeout)
    }
}
