//! Outbound message channel and inbound dispatch.
//!
//! Every outbound envelope goes through one FIFO queue drained by a single
//! writer task, so the parent observes envelopes in the order they were
//! submitted no matter which task submitted them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::SinkExt;
use tether_frame::{Envelope, EnvelopeCodec, Inbound};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace, warn};

use crate::correlation::CorrelationBus;
use crate::error::{Result, WorkerError};
use crate::events::LifecycleEvent;
use crate::lifecycle::{LifecycleController, ShutdownCause};

enum Outbound {
    Envelope {
        envelope: Envelope,
        done: oneshot::Sender<Result<()>>,
    },
    Flush {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the outbound queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl MessageChannel {
    /// Start the writer task over `writer`.
    ///
    /// Must be called from within a tokio runtime. The task exits once every
    /// clone of the returned handle is dropped.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));
        Self { tx }
    }

    /// Queue an envelope for delivery.
    ///
    /// Queueing happens immediately; the returned completion resolves once the
    /// envelope has been written or has failed. Dropping the completion does
    /// not cancel the send.
    pub fn send(&self, envelope: Envelope) -> SendCompletion {
        let (done, rx) = oneshot::channel();
        let kind = envelope.kind.clone();
        if self.tx.send(Outbound::Envelope { envelope, done }).is_err() {
            debug!(kind, "outbound queue closed; envelope dropped");
            return SendCompletion::failed(WorkerError::ChannelClosed);
        }
        trace!(kind, "envelope queued");
        SendCompletion::pending(rx)
    }

    /// Resolves once everything queued before this call has been written and
    /// the transport flushed.
    pub fn flush(&self) -> SendCompletion {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Outbound::Flush { done }).is_err() {
            return SendCompletion::failed(WorkerError::ChannelClosed);
        }
        SendCompletion::pending(rx)
    }

    /// Returns true once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, EnvelopeCodec::new());

    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Envelope { envelope, done } => {
                let kind = envelope.kind.clone();
                let result = sink.send(envelope).await.map_err(WorkerError::from);
                match &result {
                    Ok(()) => trace!(kind, "envelope written"),
                    Err(err) => warn!(kind, error = %err, "failed to write envelope"),
                }
                let _ = done.send(result);
            }
            Outbound::Flush { done } => {
                let result = SinkExt::<Envelope>::flush(&mut sink)
                    .await
                    .map_err(WorkerError::from);
                let _ = done.send(result);
            }
        }
    }

    debug!("outbound queue closed; writer exiting");
}

/// Resolves when a queued envelope has been written, or with the reason it
/// could not be.
#[derive(Debug)]
pub struct SendCompletion {
    state: Completion,
}

#[derive(Debug)]
enum Completion {
    Pending(oneshot::Receiver<Result<()>>),
    Done(Option<Result<()>>),
}

impl SendCompletion {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            state: Completion::Pending(rx),
        }
    }

    /// A completion that has already failed.
    pub fn failed(err: impl Into<WorkerError>) -> Self {
        Self {
            state: Completion::Done(Some(Err(err.into()))),
        }
    }
}

impl Future for SendCompletion {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            Completion::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(WorkerError::ChannelClosed))),
            Completion::Done(result) => {
                Poll::Ready(result.take().unwrap_or(Err(WorkerError::ChannelClosed)))
            }
        }
    }
}

/// Routes inbound envelopes: lifecycle tags to the controller, everything
/// else to the correlation bus.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    lifecycle: LifecycleController,
    bus: CorrelationBus,
}

impl Dispatcher {
    pub(crate) fn new(lifecycle: LifecycleController, bus: CorrelationBus) -> Self {
        Self { lifecycle, bus }
    }

    pub(crate) fn dispatch(&self, envelope: Envelope) {
        trace!(kind = %envelope.kind, "envelope received");
        match envelope.into_inbound() {
            Inbound::Ready { options } => self.lifecycle.ready_received(options),
            Inbound::Sync { last_sync } => self.lifecycle.emit(LifecycleEvent::Sync, &last_sync),
            Inbound::Close => self.lifecycle.begin_shutdown(ShutdownCause::CloseRequested),
            Inbound::Reply { kind, data } => {
                self.bus.resolve(&kind, data);
            }
        }
    }
}
