//! Worker lifecycle: handshake, shutdown, and the forced-exit bound.
//!
//! ```text
//! Uninitialized --ready(in)--> Ready --notify_ready--> Running
//!        \                        \                      |
//!         +------------------------+---- shutdown -----> Closing --> Terminated
//! ```
//!
//! Shutdown starts on a termination signal, an inbound `close`, parent
//! disconnect, a fatal error, or [`LifecycleController::notify_close`]. Once
//! started, termination happens within the forced-exit window whether or not
//! the application finishes its cleanup.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tether_frame::Envelope;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::channel::{MessageChannel, SendCompletion};
use crate::config::WorkerConfig;
use crate::correlation::CorrelationBus;
use crate::events::{EventRegistry, LifecycleEvent};
use crate::funnel::{ErrorReport, ExceptionFunnel};
use crate::lock;

/// Exit status after an orderly shutdown.
pub const EXIT_CLEAN: i32 = 0;

/// Exit status after a fatal error.
pub const EXIT_CRASH: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Waiting for the parent's `ready`.
    Uninitialized,
    /// Bootstrapped; the application is initializing.
    Ready,
    /// The application reported it is initialized.
    Running,
    /// Shutdown in progress.
    Closing,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What started the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// A termination signal, by name.
    Signal(&'static str),
    /// The parent sent `close`.
    CloseRequested,
    /// The parent channel reached end of stream.
    ParentDisconnected,
    /// The application called `notify_close` on its own.
    Application,
    /// An uncaught error or panic.
    Fatal,
}

impl ShutdownCause {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Fatal => EXIT_CRASH,
            _ => EXIT_CLEAN,
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "signal {name}"),
            Self::CloseRequested => f.write_str("close requested by parent"),
            Self::ParentDisconnected => f.write_str("parent disconnected"),
            Self::Application => f.write_str("application close"),
            Self::Fatal => f.write_str("fatal error"),
        }
    }
}

/// How the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub cause: ShutdownCause,
    /// True if the forced-exit timer ended the worker.
    pub forced: bool,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        self.cause.exit_code()
    }
}

struct Phase {
    state: LifecycleState,
    cause: Option<ShutdownCause>,
    close_queued: bool,
}

struct ControllerInner {
    phase: Mutex<Phase>,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
    channel: MessageChannel,
    events: Arc<EventRegistry>,
    bus: CorrelationBus,
    funnel: ExceptionFunnel,
    forced_exit_timeout: Duration,
    flush_grace: Duration,
}

/// Owns the lifecycle state machine. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

impl LifecycleController {
    pub(crate) fn new(
        channel: MessageChannel,
        events: Arc<EventRegistry>,
        bus: CorrelationBus,
        funnel: ExceptionFunnel,
        config: &WorkerConfig,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(ControllerInner {
                phase: Mutex::new(Phase {
                    state: LifecycleState::Uninitialized,
                    cause: None,
                    close_queued: false,
                }),
                outcome,
                channel,
                events,
                bus,
                funnel,
                forced_exit_timeout: config.forced_exit_timeout,
                flush_grace: config.flush_grace(),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.inner.phase).state
    }

    /// The shutdown cause, once shutdown has begun. A fatal error during
    /// shutdown replaces the original cause.
    pub fn cause(&self) -> Option<ShutdownCause> {
        lock(&self.inner.phase).cause
    }

    pub(crate) fn ready_received(&self, options: Value) {
        {
            let mut phase = lock(&self.inner.phase);
            match phase.state {
                LifecycleState::Uninitialized => {
                    phase.state = LifecycleState::Ready;
                    info!("bootstrap received from parent");
                }
                LifecycleState::Closing | LifecycleState::Terminated => {
                    debug!(state = %phase.state, "ready ignored during shutdown");
                    return;
                }
                state => debug!(%state, "repeated ready from parent"),
            }
        }
        self.emit(LifecycleEvent::Ready, &options);
    }

    /// Tell the parent the worker has finished initializing.
    ///
    /// Every call sends a `ready` envelope; repeated calls are not collapsed.
    pub fn notify_ready(&self) -> SendCompletion {
        {
            let mut phase = lock(&self.inner.phase);
            if phase.state == LifecycleState::Ready {
                phase.state = LifecycleState::Running;
                info!("worker running");
            } else {
                debug!(state = %phase.state, "ready notification outside the ready phase");
            }
        }
        self.inner.channel.send(Envelope::ready())
    }

    /// Tell the parent the worker has released its resources, then terminate.
    ///
    /// Called from a close handler, this completes the shutdown in progress.
    /// Called while running, it starts an application-driven shutdown without
    /// emitting the close event. Termination follows once the envelope is
    /// written or has failed.
    pub fn notify_close(&self) -> SendCompletion {
        self.enter_closing(ShutdownCause::Application);
        lock(&self.inner.phase).close_queued = true;
        let completion = self.inner.channel.send(Envelope::close());

        let (done, rx) = oneshot::channel();
        let controller = self.clone();
        tokio::spawn(async move {
            let result = completion.await;
            if let Err(err) = &result {
                warn!(error = %err, "close notification not delivered");
            }
            controller.terminate(false);
            let _ = done.send(result);
        });
        SendCompletion::pending(rx)
    }

    /// Start shutdown and emit the close event to subscribers.
    ///
    /// Idempotent: only the first call emits. A later [`ShutdownCause::Fatal`]
    /// still raises the exit status.
    pub fn begin_shutdown(&self, cause: ShutdownCause) {
        if self.enter_closing(cause) {
            self.emit(LifecycleEvent::Close, &Value::Null);
        }
    }

    /// Report an unrecoverable error to the parent and shut down with
    /// [`EXIT_CRASH`].
    pub fn handle_fatal(&self, report: ErrorReport) {
        error!(
            name = %report.name,
            message = %report.message,
            stack = %report.stack,
            "fatal error"
        );
        let completion = self.inner.funnel.report_error(&report);
        tokio::spawn(async move {
            if let Err(err) = completion.await {
                warn!(error = %err, "fatal error report not delivered");
            }
        });
        self.begin_shutdown(ShutdownCause::Fatal);
    }

    /// Resolves once the worker has terminated.
    pub async fn terminated(&self) -> ShutdownOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|o| *o);
        // The sender lives as long as `self`, so the wait cannot fail.
        outcome.unwrap_or(ShutdownOutcome {
            cause: ShutdownCause::Fatal,
            forced: true,
        })
    }

    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        *self.inner.outcome.borrow()
    }

    /// Run the handlers for `event`. A panicking handler is fatal.
    pub(crate) fn emit(&self, event: LifecycleEvent, payload: &Value) {
        let emission = self.inner.events.emit(event, payload);
        debug!(%event, handlers = emission.fired, "lifecycle event emitted");
        for panic in emission.panics {
            let context = format!("{event} handler");
            self.handle_fatal(ErrorReport::from_panic(&*panic, &context));
        }
    }

    /// Move to `Closing` and arm the forced-exit timer. Returns false if
    /// shutdown was already under way.
    fn enter_closing(&self, cause: ShutdownCause) -> bool {
        let mut phase = lock(&self.inner.phase);
        match phase.state {
            LifecycleState::Closing | LifecycleState::Terminated => {
                if cause == ShutdownCause::Fatal
                    && phase.state == LifecycleState::Closing
                    && phase.cause != Some(ShutdownCause::Fatal)
                {
                    warn!(previous = ?phase.cause, "fatal error during shutdown; exit status escalated");
                    phase.cause = Some(ShutdownCause::Fatal);
                } else {
                    debug!(%cause, state = %phase.state, "shutdown already in progress");
                }
                false
            }
            _ => {
                phase.state = LifecycleState::Closing;
                phase.cause = Some(cause);
                drop(phase);
                info!(
                    %cause,
                    forced_exit_ms = self.inner.forced_exit_timeout.as_millis() as u64,
                    "shutdown initiated"
                );
                self.arm_forced_exit();
                true
            }
        }
    }

    fn arm_forced_exit(&self) {
        let controller = self.clone();
        let wait = self
            .inner
            .forced_exit_timeout
            .saturating_sub(self.inner.flush_grace);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            controller.force_exit().await;
        });
    }

    async fn force_exit(&self) {
        let close_queued = {
            let mut phase = lock(&self.inner.phase);
            if phase.state == LifecycleState::Terminated {
                return;
            }
            std::mem::replace(&mut phase.close_queued, true)
        };

        let drain = if close_queued {
            self.inner.channel.flush()
        } else {
            warn!("cleanup did not finish in time; sending close on the worker's behalf");
            self.inner.channel.send(Envelope::close())
        };
        match tokio::time::timeout(self.inner.flush_grace, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "final flush failed"),
            Err(_) => debug!("final flush did not finish within the grace window"),
        }
        self.terminate(true);
    }

    fn terminate(&self, forced: bool) {
        let outcome = {
            let mut phase = lock(&self.inner.phase);
            if phase.state == LifecycleState::Terminated {
                return;
            }
            phase.state = LifecycleState::Terminated;
            ShutdownOutcome {
                cause: phase.cause.unwrap_or(ShutdownCause::Application),
                forced,
            }
        };

        let discarded = self.inner.bus.clear();
        self.inner.events.clear();
        if forced {
            warn!(cause = %outcome.cause, exit_code = outcome.exit_code(), pending_discarded = discarded, "forced exit");
        } else {
            info!(cause = %outcome.cause, exit_code = outcome.exit_code(), pending_discarded = discarded, "worker terminated");
        }
        self.inner.outcome.send_replace(Some(outcome));
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = lock(&self.inner.phase);
        f.debug_struct("LifecycleController")
            .field("state", &phase.state)
            .field("cause", &phase.cause)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::StreamExt;
    use tether_frame::EnvelopeCodec;
    use tokio::io::DuplexStream;
    use tokio_util::codec::FramedRead;

    use super::*;

    struct Harness {
        controller: LifecycleController,
        events: Arc<EventRegistry>,
        parent: FramedRead<DuplexStream, EnvelopeCodec>,
    }

    fn harness() -> Harness {
        let (ours, theirs) = tokio::io::duplex(4096);
        let config = WorkerConfig::default();
        let channel = MessageChannel::spawn(ours);
        let funnel = ExceptionFunnel::new(channel.clone());
        let bus = CorrelationBus::new(channel.clone(), funnel.clone(), config.request_timeout);
        let events = Arc::new(EventRegistry::new());
        let controller =
            LifecycleController::new(channel, Arc::clone(&events), bus, funnel, &config);
        Harness {
            controller,
            events,
            parent: FramedRead::new(theirs, EnvelopeCodec::new()),
        }
    }

    #[test]
    fn exit_codes_follow_cause() {
        assert_eq!(ShutdownCause::Signal("SIGTERM").exit_code(), EXIT_CLEAN);
        assert_eq!(ShutdownCause::CloseRequested.exit_code(), EXIT_CLEAN);
        assert_eq!(ShutdownCause::ParentDisconnected.exit_code(), EXIT_CLEAN);
        assert_eq!(ShutdownCause::Fatal.exit_code(), EXIT_CRASH);
    }

    #[tokio::test]
    async fn handshake_moves_through_ready_to_running() {
        let mut h = harness();
        assert_eq!(h.controller.state(), LifecycleState::Uninitialized);

        h.controller.ready_received(Value::Null);
        assert_eq!(h.controller.state(), LifecycleState::Ready);

        h.controller.notify_ready().await.unwrap();
        assert_eq!(h.controller.state(), LifecycleState::Running);
        assert_eq!(h.parent.next().await.unwrap().unwrap().kind, "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn close_without_handlers_is_forced_within_window() {
        let mut h = harness();
        let started = tokio::time::Instant::now();
        h.controller.begin_shutdown(ShutdownCause::Signal("SIGTERM"));

        let outcome = h.controller.terminated().await;
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(outcome.forced);
        assert_eq!(outcome.exit_code(), EXIT_CLEAN);
        assert_eq!(h.parent.next().await.unwrap().unwrap().kind, "close");
    }

    #[tokio::test(start_paused = true)]
    async fn close_handler_completes_shutdown_gracefully() {
        let mut h = harness();
        let controller = h.controller.clone();
        h.events.once(LifecycleEvent::Close, move |_| {
            let _ = controller.notify_close();
        });

        h.controller.begin_shutdown(ShutdownCause::CloseRequested);
        let outcome = h.controller.terminated().await;

        assert!(!outcome.forced);
        assert_eq!(outcome.cause, ShutdownCause::CloseRequested);
        assert_eq!(h.parent.next().await.unwrap().unwrap().kind, "close");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_emits_close_once() {
        let h = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        h.events.on(LifecycleEvent::Close, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.controller.begin_shutdown(ShutdownCause::Signal("SIGINT"));
        h.controller.begin_shutdown(ShutdownCause::Signal("SIGTERM"));
        h.controller.begin_shutdown(ShutdownCause::CloseRequested);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.cause(), Some(ShutdownCause::Signal("SIGINT")));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_during_shutdown_escalates_exit_status() {
        let h = harness();
        h.controller.begin_shutdown(ShutdownCause::Signal("SIGTERM"));
        h.controller
            .handle_fatal(ErrorReport::new("Error", "cleanup failed", "Error: cleanup failed"));

        let outcome = h.controller.terminated().await;
        assert_eq!(outcome.cause, ShutdownCause::Fatal);
        assert_eq!(outcome.exit_code(), EXIT_CRASH);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_close_handler_is_fatal() {
        let mut h = harness();
        h.events.on(LifecycleEvent::Close, |_| panic!("cleanup exploded"));

        h.controller.begin_shutdown(ShutdownCause::CloseRequested);
        let outcome = h.controller.terminated().await;
        assert_eq!(outcome.exit_code(), EXIT_CRASH);

        let error = h.parent.next().await.unwrap().unwrap();
        assert_eq!(error.kind, "error");
        assert_eq!(error.data["name"], "Panic");
        assert_eq!(error.data["message"], "cleanup exploded");
        assert_eq!(h.parent.next().await.unwrap().unwrap().kind, "close");
    }

    #[tokio::test(start_paused = true)]
    async fn termination_discards_handlers() {
        let h = harness();
        h.events.on(LifecycleEvent::Sync, |_| {});
        h.controller.begin_shutdown(ShutdownCause::ParentDisconnected);
        h.controller.terminated().await;

        assert_eq!(h.events.listener_count(LifecycleEvent::Sync), 0);
        assert_eq!(h.controller.state(), LifecycleState::Terminated);
    }
}
