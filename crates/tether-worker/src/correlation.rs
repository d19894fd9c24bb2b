//! Request/reply correlation over the parent channel.
//!
//! Each request gets a fresh id. The parent answers with an envelope whose
//! `type` is that id, and the bus routes the reply to exactly one waiter. A
//! binding is released on reply, on timeout, on delivery failure, or at
//! shutdown, whichever comes first.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::{json, Value};
use tether_frame::{Envelope, REQUEST_DEVICE_INFO};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{MessageChannel, SendCompletion};
use crate::error::{Result, ValidationError, WorkerError};
use crate::funnel::{ErrorReport, ExceptionFunnel};
use crate::lock;

/// Unique identifier of one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

struct PendingRequest {
    subject: String,
    registered_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

struct BusInner {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    channel: MessageChannel,
    funnel: ExceptionFunnel,
    timeout: Duration,
}

/// Registry of in-flight correlated requests. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationBus {
    inner: Arc<BusInner>,
}

impl CorrelationBus {
    pub fn new(channel: MessageChannel, funnel: ExceptionFunnel, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                pending: Mutex::new(HashMap::new()),
                channel,
                funnel,
                timeout,
            }),
        }
    }

    /// Send a request whose reply is routed back by correlation id.
    ///
    /// `payload` builds the outbound `data` from the generated id and the
    /// subject. The binding is registered before the envelope is queued, so a
    /// reply can never arrive ahead of it. A blank `subject_id` is rejected
    /// and nothing is sent.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_correlated<F>(
        &self,
        subject_id: &str,
        outbound_type: &str,
        payload: F,
    ) -> std::result::Result<PendingReply, ValidationError>
    where
        F: FnOnce(&CorrelationId, &str) -> Value,
    {
        if subject_id.trim().is_empty() {
            return Err(ValidationError::SubjectId);
        }

        let (reply, rx) = oneshot::channel();
        let id = {
            let mut pending = lock(&self.inner.pending);
            let id = loop {
                let candidate = CorrelationId::generate();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(
                id.clone(),
                PendingRequest {
                    subject: subject_id.to_string(),
                    registered_at: Instant::now(),
                    reply,
                    timer: self.arm_timeout(id.clone()),
                },
            );
            id
        };
        debug!(correlation_id = %id, subject = subject_id, kind = outbound_type, "request registered");

        let envelope = Envelope::new(outbound_type, payload(&id, subject_id));
        let completion = self.inner.channel.send(envelope);
        self.watch_delivery(id.clone(), completion);

        Ok(PendingReply { id, rx })
    }

    /// Ask the parent for a device's registration. The reply is the device
    /// record, or null if the device is unknown.
    pub fn request_device_info(
        &self,
        device_id: &str,
    ) -> std::result::Result<PendingReply, ValidationError> {
        self.request_correlated(device_id, REQUEST_DEVICE_INFO, |id, device| {
            json!({ "requestId": id.as_str(), "deviceId": device })
        })
    }

    /// Deliver a reply. Returns false if `id` is unknown or already released.
    pub fn resolve(&self, id: &str, data: Value) -> bool {
        let Some(request) = lock(&self.inner.pending).remove(id) else {
            debug!(correlation_id = id, "no pending request for reply; dropped");
            return false;
        };
        request.timer.abort();
        debug!(
            correlation_id = id,
            subject = %request.subject,
            elapsed_ms = request.registered_at.elapsed().as_millis() as u64,
            "request resolved"
        );
        if request.reply.send(Ok(data)).is_err() {
            debug!(correlation_id = id, "reply waiter went away");
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.inner.pending).contains_key(id)
    }

    /// Release every binding, resolving waiters with [`WorkerError::Shutdown`].
    /// Returns how many were outstanding.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner.pending).drain().collect();
        let count = drained.len();
        for (_, request) in drained {
            request.timer.abort();
            let _ = request.reply.send(Err(WorkerError::Shutdown));
        }
        count
    }

    fn arm_timeout(&self, id: CorrelationId) -> JoinHandle<()> {
        let bus = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(bus) = upgrade(&bus) {
                bus.expire(&id);
            }
        })
    }

    fn watch_delivery(&self, id: CorrelationId, completion: SendCompletion) {
        let bus = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = completion.await {
                if let Some(bus) = upgrade(&bus) {
                    bus.abandon(&id, err);
                }
            }
        });
    }

    fn expire(&self, id: &CorrelationId) {
        let Some(request) = lock(&self.inner.pending).remove(id) else {
            return;
        };
        debug!(
            correlation_id = %id,
            subject = %request.subject,
            timeout_ms = self.inner.timeout.as_millis() as u64,
            "request expired without reply"
        );
        let _ = request.reply.send(Err(WorkerError::Timeout(self.inner.timeout)));
    }

    fn abandon(&self, id: &CorrelationId, err: WorkerError) {
        warn!(correlation_id = %id, error = %err, "request could not be delivered");
        let report = ErrorReport::from_error(&err);
        if let Some(request) = lock(&self.inner.pending).remove(id) {
            request.timer.abort();
            let _ = request.reply.send(Err(WorkerError::Undelivered(err.to_string())));
        }
        drop(self.inner.funnel.report_error(&report));
    }
}

fn upgrade(inner: &Weak<BusInner>) -> Option<CorrelationBus> {
    inner.upgrade().map(|inner| CorrelationBus { inner })
}

impl fmt::Debug for CorrelationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationBus")
            .field("pending", &self.pending_count())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// The eventual reply to a correlated request.
///
/// Resolves with the reply payload, or with [`WorkerError::Timeout`],
/// [`WorkerError::Undelivered`] or [`WorkerError::Shutdown`]. Dropping it
/// does not release the binding; a late reply is then discarded.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingReply {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(WorkerError::Shutdown)))
    }
}
