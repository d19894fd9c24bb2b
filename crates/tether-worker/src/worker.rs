use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tether_frame::{Envelope, EnvelopeCodec};
use tether_transport::{Endpoint, IpcStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::channel::{Dispatcher, MessageChannel, SendCompletion};
use crate::config::WorkerConfig;
use crate::correlation::{CorrelationBus, PendingReply};
use crate::error::{Result, ValidationError, WorkerError};
use crate::events::{EventRegistry, LifecycleEvent, ListenerId};
use crate::funnel::{ErrorReport, ExceptionFunnel};
use crate::lifecycle::{LifecycleController, LifecycleState, ShutdownCause, ShutdownOutcome};
use crate::signal::TerminationSignals;

struct WorkerInner {
    channel: MessageChannel,
    events: Arc<EventRegistry>,
    bus: CorrelationBus,
    funnel: ExceptionFunnel,
    lifecycle: LifecycleController,
}

/// Application-facing handle to the parent channel. Cheap to clone.
///
/// Created together with a [`WorkerRuntime`], which must be driven for
/// inbound envelopes to be dispatched:
///
/// ```no_run
/// # async fn demo() -> tether_worker::Result<()> {
/// use tether_transport::Endpoint;
/// use tether_worker::{Worker, WorkerConfig};
///
/// let (worker, runtime) = Worker::connect(&Endpoint::from_env()?, WorkerConfig::default()).await?;
/// let handle = worker.clone();
/// worker.on_ready(move |_options| {
///     let _ = handle.notify_ready();
/// });
/// let handle = worker.clone();
/// worker.on_close(move || {
///     let _ = handle.notify_close();
/// });
/// let outcome = runtime.run().await;
/// std::process::exit(outcome.exit_code());
/// # }
/// ```
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Open the parent channel at `endpoint`.
    pub async fn connect(
        endpoint: &Endpoint,
        config: WorkerConfig,
    ) -> Result<(Self, WorkerRuntime<ReadHalf<IpcStream>>)> {
        let stream = IpcStream::connect(endpoint).await?;
        info!(%endpoint, "parent channel open");
        Ok(Self::from_stream(stream, config))
    }

    /// Build a worker over any duplex byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<T>(stream: T, config: WorkerConfig) -> (Self, WorkerRuntime<ReadHalf<T>>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer, config)
    }

    /// Build a worker over separate read and write halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_parts<R, W>(reader: R, writer: W, config: WorkerConfig) -> (Self, WorkerRuntime<R>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = MessageChannel::spawn(writer);
        let events = Arc::new(EventRegistry::new());
        let funnel = ExceptionFunnel::new(channel.clone());
        let bus = CorrelationBus::new(channel.clone(), funnel.clone(), config.request_timeout);
        let lifecycle = LifecycleController::new(
            channel.clone(),
            Arc::clone(&events),
            bus.clone(),
            funnel.clone(),
            &config,
        );

        let runtime = WorkerRuntime {
            inbound: FramedRead::new(reader, EnvelopeCodec::with_config(&config.frame_config())),
            dispatcher: Dispatcher::new(lifecycle.clone(), bus.clone()),
            lifecycle: lifecycle.clone(),
            handle_signals: config.handle_signals,
        };
        let worker = Self {
            inner: Arc::new(WorkerInner {
                channel,
                events,
                bus,
                funnel,
                lifecycle,
            }),
        };
        (worker, runtime)
    }

    /// Handle the parent's bootstrap. Fires once with the options object.
    pub fn on_ready<F>(&self, handler: F) -> ListenerId
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let mut handler = Some(handler);
        self.inner.events.once(LifecycleEvent::Ready, move |options| {
            if let Some(handler) = handler.take() {
                handler(options.clone());
            }
        })
    }

    /// Handle shutdown. Fires once; the handler should release resources and
    /// then call [`Worker::notify_close`].
    pub fn on_close<F>(&self, handler: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handler = Some(handler);
        self.inner.events.once(LifecycleEvent::Close, move |_| {
            if let Some(handler) = handler.take() {
                handler();
            }
        })
    }

    /// Handle every sync point with the parent's last sync timestamp.
    pub fn on_sync<F>(&self, mut handler: F) -> ListenerId
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.inner
            .events
            .on(LifecycleEvent::Sync, move |last_sync| handler(last_sync.clone()))
    }

    /// Direct access to the lifecycle event registry.
    pub fn events(&self) -> &EventRegistry {
        &self.inner.events
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.inner.lifecycle
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// See [`LifecycleController::notify_ready`].
    pub fn notify_ready(&self) -> SendCompletion {
        self.inner.lifecycle.notify_ready()
    }

    /// See [`LifecycleController::notify_close`].
    pub fn notify_close(&self) -> SendCompletion {
        self.inner.lifecycle.notify_close()
    }

    /// Look up a device's registration with the parent. Resolves with the
    /// device record, or null if the device is not registered.
    pub fn request_device_info(
        &self,
        device_id: &str,
    ) -> std::result::Result<PendingReply, ValidationError> {
        self.inner.bus.request_device_info(device_id)
    }

    /// Send an arbitrary correlated request.
    /// See [`CorrelationBus::request_correlated`].
    pub fn request_correlated<F>(
        &self,
        subject_id: &str,
        outbound_type: &str,
        payload: F,
    ) -> std::result::Result<PendingReply, ValidationError>
    where
        F: FnOnce(&crate::CorrelationId, &str) -> Value,
    {
        self.inner
            .bus
            .request_correlated(subject_id, outbound_type, payload)
    }

    pub fn correlation(&self) -> &CorrelationBus {
        &self.inner.bus
    }

    /// Store `state` against a device.
    pub fn set_device_state(&self, device_id: &str, state: Value) -> SendCompletion {
        if device_id.trim().is_empty() {
            return SendCompletion::failed(ValidationError::SubjectId);
        }
        self.inner
            .channel
            .send(Envelope::set_device_state(device_id, state))
    }

    /// Hand device data to the parent for processing.
    pub fn send_data(&self, device: &str, data: &str) -> SendCompletion {
        if device.trim().is_empty() {
            return SendCompletion::failed(ValidationError::SubjectId);
        }
        if data.trim().is_empty() {
            return SendCompletion::failed(ValidationError::Data);
        }
        self.inner.channel.send(Envelope::data(device, data))
    }

    /// Forward a log line to the parent's loggers.
    pub fn log(&self, data: &str) -> SendCompletion {
        if data.trim().is_empty() {
            return SendCompletion::failed(ValidationError::LogData);
        }
        self.inner.channel.send(Envelope::log(data))
    }

    /// Send a structured error report without shutting down.
    pub fn report_error(&self, report: &ErrorReport) -> SendCompletion {
        self.inner.funnel.report_error(report)
    }

    /// Shorthand for [`Worker::report_error`] with [`ErrorReport::from_error`].
    pub fn report<E>(&self, err: &E) -> SendCompletion
    where
        E: std::error::Error + ?Sized,
    {
        self.report_error(&ErrorReport::from_error(err))
    }

    /// Report `err` and shut down with a failure exit status.
    pub fn fatal<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        self.inner.lifecycle.handle_fatal(ErrorReport::from_error(err));
    }

    /// Spawn a supervised task. An `Err` return or a panic is fatal.
    pub fn spawn<F, E>(&self, task: &'static str, future: F) -> AbortHandle
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        let lifecycle = self.inner.lifecycle.clone();
        let handle = tokio::spawn(future);
        let abort = handle.abort_handle();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(())) => debug!(task, "task finished"),
                Ok(Err(err)) => {
                    warn!(task, error = %err, "task failed");
                    lifecycle.handle_fatal(ErrorReport::from_error(&err));
                }
                Err(join) if join.is_panic() => {
                    let payload = join.into_panic();
                    lifecycle.handle_fatal(ErrorReport::from_panic(&*payload, task));
                }
                Err(_) => debug!(task, "task cancelled"),
            }
        });
        abort
    }

    /// Spawn a supervised task with no error path of its own. A panic is
    /// still fatal.
    pub fn spawn_infallible<F>(&self, task: &'static str, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(task, async move {
            future.await;
            Ok::<(), std::convert::Infallible>(())
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("lifecycle", &self.inner.lifecycle)
            .field("correlation", &self.inner.bus)
            .finish()
    }
}

/// Drives inbound dispatch and signal handling until termination.
pub struct WorkerRuntime<R> {
    inbound: FramedRead<R, EnvelopeCodec>,
    dispatcher: Dispatcher,
    lifecycle: LifecycleController,
    handle_signals: bool,
}

impl<R> WorkerRuntime<R>
where
    R: AsyncRead + Unpin,
{
    /// Run until the worker terminates and return how it ended.
    ///
    /// Parent end-of-stream starts an orderly shutdown. An unreadable or
    /// oversized frame is fatal.
    pub async fn run(mut self) -> ShutdownOutcome {
        let mut signals = if self.handle_signals {
            match TerminationSignals::install() {
                Ok(signals) => Some(signals),
                Err(err) => {
                    warn!(error = %err, "termination signal handlers unavailable");
                    None
                }
            }
        } else {
            None
        };
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                outcome = self.lifecycle.terminated() => return outcome,

                name = recv_signal(&mut signals) => {
                    info!(signal = name, "termination signal received");
                    self.lifecycle.begin_shutdown(ShutdownCause::Signal(name));
                }

                frame = self.inbound.next(), if inbound_open => match frame {
                    Some(Ok(envelope)) => self.dispatcher.dispatch(envelope),
                    Some(Err(err)) => {
                        inbound_open = false;
                        let err = WorkerError::from(err);
                        self.lifecycle.handle_fatal(ErrorReport::from_error(&err));
                    }
                    None => {
                        inbound_open = false;
                        info!("parent closed the channel");
                        self.lifecycle.begin_shutdown(ShutdownCause::ParentDisconnected);
                    }
                },
            }
        }
    }
}

async fn recv_signal(signals: &mut Option<TerminationSignals>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}
