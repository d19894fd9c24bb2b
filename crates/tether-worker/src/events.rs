//! Lifecycle event registry.
//!
//! Handlers are keyed by the fixed [`LifecycleEvent`] set. Correlation replies
//! never pass through here; they live in the [`CorrelationBus`](crate::CorrelationBus).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use serde_json::Value;

use crate::lock;

/// Built-in lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Parent bootstrapped the worker; payload is the options object.
    Ready,
    /// Parent sync point; payload is the last sync timestamp.
    Sync,
    /// Shutdown requested; payload is null.
    Close,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Sync => write!(f, "sync"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Handle returned on registration, usable with [`EventRegistry::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Box<dyn FnMut(&Value) + Send + 'static>;

struct Listener {
    id: ListenerId,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<LifecycleEvent, Vec<Listener>>,
    next_id: u64,
    // Bumped by `clear` so an in-flight emit does not restore discarded handlers.
    generation: u64,
}

/// Result of one [`EventRegistry::emit`] call.
#[derive(Default)]
pub struct Emission {
    /// Number of handlers invoked.
    pub fired: usize,
    /// Panic payloads from handlers that unwound.
    pub panics: Vec<Box<dyn Any + Send>>,
}

/// Ordered handler lists per lifecycle event, one-shot or persistent.
#[derive(Default)]
pub struct EventRegistry {
    inner: Mutex<Registry>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent handler.
    pub fn on<F>(&self, event: LifecycleEvent, handler: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.add(event, false, Box::new(handler))
    }

    /// Register a handler that is removed after it fires once.
    pub fn once<F>(&self, event: LifecycleEvent, handler: F) -> ListenerId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.add(event, true, Box::new(handler))
    }

    fn add(&self, event: LifecycleEvent, once: bool, handler: Handler) -> ListenerId {
        let mut inner = lock(&self.inner);
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.entry(event).or_default().push(Listener {
            id,
            once,
            handler,
        });
        id
    }

    /// Remove a handler. Returns false if it already fired (one-shot), was
    /// removed, or is currently executing.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = lock(&self.inner);
        for listeners in inner.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, event: LifecycleEvent) -> usize {
        lock(&self.inner)
            .listeners
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Discard every handler for every event.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.listeners.clear();
        inner.generation += 1;
    }

    /// Invoke the handlers of `event` in registration order.
    ///
    /// The lock is released while handlers run, so a handler may register,
    /// remove, or emit. Handlers registered during the emission run on the
    /// next one. A panicking handler does not stop the remaining handlers;
    /// its payload is returned to the caller.
    pub fn emit(&self, event: LifecycleEvent, payload: &Value) -> Emission {
        let (taken, generation) = {
            let mut inner = lock(&self.inner);
            let taken = inner.listeners.remove(&event).unwrap_or_default();
            (taken, inner.generation)
        };

        let mut emission = Emission::default();
        let mut retained = Vec::with_capacity(taken.len());
        for mut listener in taken {
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.handler)(payload)));
            emission.fired += 1;
            if let Err(panic) = outcome {
                emission.panics.push(panic);
            }
            if !listener.once {
                retained.push(listener);
            }
        }

        if !retained.is_empty() {
            let mut inner = lock(&self.inner);
            if inner.generation == generation {
                let listeners = inner.listeners.entry(event).or_default();
                let added = std::mem::replace(listeners, retained);
                listeners.extend(added);
            }
        }

        emission
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        let counts: HashMap<_, _> = inner
            .listeners
            .iter()
            .map(|(event, listeners)| (*event, listeners.len()))
            .collect();
        f.debug_struct("EventRegistry")
            .field("listeners", &counts)
            .finish()
    }
}
