//! Event Bus - listener registry plus broadcast channel
//!
//! Synchronous listeners registered with [`EventBus::on`] are called inline
//! at the emission site, each one isolated: a listener that returns an
//! error or panics is logged and skipped, and the remaining listeners still
//! run. Async consumers can [`EventBus::subscribe`] to a broadcast channel
//! instead.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::LimiterEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Callback invoked for every emitted event
pub type Listener = Arc<dyn Fn(&LimiterEvent) -> eyre::Result<()> + Send + Sync>;

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registry = Arc<RwLock<Vec<(ListenerId, Listener)>>>;

/// Central event bus for one or more limiters
pub struct EventBus {
    tx: broadcast::Sender<LimiterEvent>,
    listeners: Registry,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Register a listener; drop or `unsubscribe` the returned handle's id to remove it
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LimiterEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(?id, "EventBus::on: registering listener");
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Remove a listener; returns false if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        debug!(?id, "EventBus::off: called");
        remove_listener(&self.listeners, id)
    }

    /// Emit an event to every listener and subscriber
    pub fn emit(&self, event: LimiterEvent) {
        debug!(
            event_type = event.event_type(),
            limiter_id = event.limiter_id(),
            "EventBus::emit"
        );

        // Snapshot so listeners can register or unregister from inside a callback
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(?id, event_type = event.event_type(), error = %e, "Event listener failed");
                }
                Err(_) => {
                    warn!(?id, event_type = event.event_type(), "Event listener panicked");
                }
            }
        }

        // No subscribers is OK
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events asynchronously
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Number of active broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Remove every listener
    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn remove_listener(registry: &RwLock<Vec<(ListenerId, Listener)>>, id: ListenerId) -> bool {
    let mut listeners = registry.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = listeners.len();
    listeners.retain(|(listener_id, _)| *listener_id != id);
    listeners.len() != before
}

/// Handle returned by [`EventBus::on`]
///
/// Dropping it leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    registry: Weak<RwLock<Vec<(ListenerId, Listener)>>>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener; returns false if it was already gone
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => remove_listener(&registry, self.id),
            None => false,
        }
    }
}

/// Handle for emitting events tagged with one limiter id
#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<EventBus>,
    limiter_id: String,
}

impl EventEmitter {
    pub fn new(bus: Arc<EventBus>, limiter_id: impl Into<String>) -> Self {
        Self {
            bus,
            limiter_id: limiter_id.into(),
        }
    }

    /// Get the limiter ID this emitter is bound to
    pub fn limiter_id(&self) -> &str {
        &self.limiter_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Emit a raw event
    pub fn emit(&self, event: LimiterEvent) {
        self.bus.emit(event);
    }

    // === Convenience methods ===

    pub fn rate_limited(&self, wait_ms: u64, queue_size: usize) {
        self.emit(LimiterEvent::RateLimited {
            limiter_id: self.limiter_id.clone(),
            wait_ms,
            queue_size,
        });
    }

    pub fn request_queued(
        &self,
        request_id: &str,
        priority: i32,
        queue_size: usize,
        metadata: &std::collections::HashMap<String, serde_json::Value>,
    ) {
        self.emit(LimiterEvent::RequestQueued {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
            priority,
            queue_size,
            metadata: metadata.clone(),
        });
    }

    pub fn request_started(&self, request_id: &str, queue_time_ms: u64, active: usize) {
        self.emit(LimiterEvent::RequestStarted {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
            queue_time_ms,
            active,
        });
    }

    pub fn request_completed(&self, request_id: &str, execution_time_ms: u64, retries: u32) {
        self.emit(LimiterEvent::RequestCompleted {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
            execution_time_ms,
            retries,
        });
    }

    pub fn request_failed(&self, request_id: &str, error: &str, attempts: u32) {
        self.emit(LimiterEvent::RequestFailed {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
            error: error.to_string(),
            attempts,
        });
    }

    pub fn request_requeued(&self, request_id: &str, attempt: u32, delay_ms: u64, error: &str) {
        self.emit(LimiterEvent::RequestRequeued {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
            attempt,
            delay_ms,
            error: error.to_string(),
        });
    }

    pub fn request_expired(&self, request_id: &str) {
        self.emit(LimiterEvent::RequestExpired {
            limiter_id: self.limiter_id.clone(),
            request_id: request_id.to_string(),
        });
    }

    pub fn error(&self, context: &str, message: &str) {
        self.emit(LimiterEvent::Error {
            limiter_id: self.limiter_id.clone(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }
}
