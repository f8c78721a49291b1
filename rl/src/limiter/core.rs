//! Rate limiter implementation

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use ratestore::{MemoryStore, RateLimitStore, StoreError};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RateLimitError, WorkError};
use crate::events::{EventBus, EventEmitter, LimiterEvent, ListenerId, Subscription};
use crate::retry::backoff_delay;

use super::config::{DynamicRateLimitConfig, RateLimit, RateLimiterConfig, RateStatus, StaticRateLimitConfig};
use super::queue::{Output, PriorityQueue, QueuedRequest, RequestId, ScheduleOptions};
use super::stats::{RateLimiterStats, ScheduleResult, StatsTracker};

/// Floor for a rate-limit wait so an already-passed reset can't spin the drain loop
const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_millis(10);

type Resolution = Result<ScheduleResult<Output>, RateLimitError>;
type Resolver = oneshot::Sender<Resolution>;

/// Result of an admission check
#[derive(Debug, Clone)]
pub struct Admission {
    pub allowed: bool,

    /// How long to wait before checking again (zero when allowed)
    pub wait: Duration,

    /// Static window an admitted request is recorded against
    window: Option<StaticRateLimitConfig>,
}

impl Admission {
    fn allow(window: Option<StaticRateLimitConfig>) -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
            window,
        }
    }

    fn deny(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
            window: None,
        }
    }
}

/// Limiter state; never held across an await
#[derive(Default)]
struct State {
    queue: PriorityQueue,
    pending: HashMap<RequestId, Resolver>,
    active: usize,
    stats: StatsTracker,
}

struct Shared {
    config: RateLimiterConfig,
    store: Arc<dyn RateLimitStore>,
    events: EventEmitter,
    state: Mutex<State>,
    draining: AtomicBool,
    redrain: AtomicBool,
    destroyed: AtomicBool,
    shutdown: Notify,
}

/// The RateLimiter admits queued work under a concurrency cap and a rate limit,
/// retrying transient failures with backoff.
///
/// Cheap to clone; clones share the same queue and counters. All methods that
/// enqueue work must be called from within a tokio runtime.
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// Create a limiter backed by a private in-memory store
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a limiter backed by the given store
    pub fn with_store(config: RateLimiterConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self::from_parts(config, store, Arc::new(EventBus::with_default_capacity()))
    }

    /// Create a limiter with a store and an event bus that may be shared
    pub fn from_parts(mut config: RateLimiterConfig, store: Arc<dyn RateLimitStore>, bus: Arc<EventBus>) -> Self {
        debug!(?config, "RateLimiter::new: called");
        if config.max_concurrent == 0 {
            warn!(id = %config.id, "max_concurrent of 0 is invalid, using 1");
            config.max_concurrent = 1;
        }
        let events = EventEmitter::new(bus, config.id.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                events,
                state: Mutex::new(State::default()),
                draining: AtomicBool::new(false),
                redrain: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.shared.config
    }

    /// Schedule a unit of work and wait for its outcome
    ///
    /// Fails with the work's own error once retries are exhausted, or with an
    /// admission error if the queue is full or the limiter was destroyed.
    pub async fn schedule<F, Fut, T>(
        &self,
        work: F,
        options: ScheduleOptions,
    ) -> Result<ScheduleResult<T>, RateLimitError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(work, options)?.await
    }

    /// Enqueue a unit of work and return a handle resolving with its outcome
    ///
    /// Admission errors are returned here, before anything is enqueued.
    /// Dropping the handle does not cancel the request.
    pub fn submit<F, Fut, T>(&self, work: F, options: ScheduleOptions) -> Result<ScheduleHandle<T>, RateLimitError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
        T: Send + 'static,
    {
        let shared = &self.shared;
        debug!(id = %shared.config.id, priority = options.priority, "RateLimiter::submit: called");

        if shared.is_destroyed() {
            debug!("RateLimiter::submit: destroyed, rejecting");
            shared.state().stats.total_rejected += 1;
            return Err(RateLimitError::Destroyed);
        }

        let request = QueuedRequest::new(work, options);
        let request_id = request.id.clone();
        let priority = request.priority;
        let metadata = request.metadata.clone();
        let (tx, rx) = oneshot::channel();

        let queue_size = {
            let mut state = shared.state();
            if let Some(max) = shared.config.max_queue_size {
                if state.queue.len() >= max {
                    debug!(max, "RateLimiter::submit: queue full, rejecting");
                    state.stats.total_rejected += 1;
                    return Err(RateLimitError::QueueFull { max });
                }
            }
            state.pending.insert(request_id.clone(), tx);
            state.queue.enqueue(request);
            let depth = state.queue.len();
            state.stats.observe_queue_depth(depth);
            depth
        };

        shared.events.request_queued(&request_id, priority, queue_size, &metadata);
        shared.trigger_drain();

        Ok(ScheduleHandle {
            id: request_id,
            rx,
            _marker: PhantomData,
        })
    }

    /// Check whether the rate limit currently permits a new execution
    pub async fn can_make_request(&self) -> Admission {
        self.shared.can_make_request().await
    }

    /// Remove a still-queued request, rejecting its handle
    ///
    /// Returns false if the request is unknown or already executing.
    pub fn cancel(&self, request_id: &str) -> bool {
        debug!(%request_id, "RateLimiter::cancel: called");
        let resolver = {
            let mut state = self.shared.state();
            let Some(request) = state.queue.remove_by_id(request_id) else {
                debug!(%request_id, "RateLimiter::cancel: not queued");
                return false;
            };
            state.stats.total_rejected += 1;
            state.pending.remove(&request.id)
        };
        if let Some(tx) = resolver {
            let _ = tx.send(Err(RateLimitError::Cancelled {
                id: request_id.to_string(),
            }));
        }
        true
    }

    /// Reset this limiter's window in the store
    pub async fn reset(&self) -> Result<(), StoreError> {
        debug!(id = %self.shared.config.id, "RateLimiter::reset: called");
        self.shared.store.reset(&self.shared.config.id).await
    }

    /// Current statistics
    pub fn stats(&self) -> RateLimiterStats {
        let state = self.shared.state();
        state.stats.snapshot(state.queue.len(), state.active)
    }

    /// Ids of queued requests in the order they would be admitted
    pub fn queued_ids(&self) -> Vec<RequestId> {
        self.shared.state().queue.ids_in_order()
    }

    /// Register an event listener
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LimiterEvent) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.bus().on(listener)
    }

    /// Remove an event listener
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.events.bus().off(id)
    }

    /// Receive events on a broadcast channel
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LimiterEvent> {
        self.shared.events.bus().subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Reject all queued work, refuse new work, and close the store
    ///
    /// Executing requests run to completion and still resolve their handles.
    /// Calling this more than once is a no-op.
    pub async fn destroy(&self) {
        let shared = &self.shared;
        if shared.destroyed.swap(true, Ordering::AcqRel) {
            debug!("RateLimiter::destroy: already destroyed");
            return;
        }
        info!(id = %shared.config.id, "Destroying rate limiter");

        let rejected: Vec<_> = {
            let mut state = shared.state();
            let drained = state.queue.clear();
            state.stats.total_rejected += drained.len() as u64;
            drained
                .into_iter()
                .filter_map(|request| state.pending.remove(&request.id))
                .collect()
        };
        debug!(count = rejected.len(), "RateLimiter::destroy: rejecting queued requests");
        for tx in rejected {
            let _ = tx.send(Err(RateLimitError::Destroyed));
        }

        shared.shutdown.notify_waiters();

        if let Err(e) = shared.store.close().await {
            warn!(error = %e, "Failed to close rate limit store");
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Start a drain unless one is running; a running drain makes another pass
    fn trigger_drain(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        self.redrain.store(true, Ordering::Release);
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).drain());
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            self.redrain.store(false, Ordering::Release);
            {
                // Released even if the pass unwinds
                let _draining = DrainGuard(&self.draining);
                self.drain_pass().await;
            }

            // A trigger that landed mid-pass found the flag taken
            if !self.redrain.load(Ordering::Acquire) || self.is_destroyed() {
                break;
            }
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                break;
            }
        }
    }

    async fn drain_pass(self: &Arc<Self>) {
        loop {
            if self.is_destroyed() {
                return;
            }

            let expired: Vec<_> = {
                let mut state = self.state();
                if state.queue.is_empty() || state.active >= self.config.max_concurrent {
                    return;
                }
                let expired = state.queue.remove_expired(Instant::now());
                state.stats.total_expired += expired.len() as u64;
                state.stats.total_rejected += expired.len() as u64;
                expired
                    .into_iter()
                    .map(|request| {
                        let resolver = state.pending.remove(&request.id);
                        (request.id, resolver)
                    })
                    .collect()
            };
            if !expired.is_empty() {
                for (id, resolver) in expired {
                    debug!(%id, "drain: request expired in queue");
                    if let Some(tx) = resolver {
                        let _ = tx.send(Err(RateLimitError::Expired { id: id.clone() }));
                    }
                    self.events.request_expired(&id);
                }
                continue;
            }

            // Registered before the check so a destroy during a slow check still wakes the wait
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            let admission = self.can_make_request().await;
            if self.is_destroyed() {
                debug!("drain: destroyed during admission check");
                return;
            }
            if !admission.allowed {
                let wait = admission.wait.max(MIN_RATE_LIMIT_WAIT);
                let queue_size = {
                    let mut state = self.state();
                    state.stats.total_rate_limited += 1;
                    state.queue.len()
                };
                debug!(?wait, queue_size, "drain: rate limited, waiting");
                self.events.rate_limited(wait.as_millis() as u64, queue_size);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = &mut shutdown => {}
                }
                continue;
            }

            let request = {
                let mut state = self.state();
                if self.is_destroyed() || state.active >= self.config.max_concurrent {
                    return;
                }
                let Some(request) = state.queue.dequeue() else {
                    return;
                };
                state.active += 1;
                let active = state.active;
                state.stats.observe_concurrency(active);
                request
            };

            // Recorded before the next check so a burst can't overshoot the window
            if let Some(window) = &admission.window {
                if let Err(e) = self.store.increment(&self.config.id, window.interval()).await {
                    warn!(error = %e, "Failed to record admission");
                    self.events.error("record", &e.to_string());
                }
            }

            debug!(id = %request.id, "drain: admitted");
            tokio::spawn(Arc::clone(self).execute(request));
        }
    }

    async fn can_make_request(&self) -> Admission {
        match &self.config.limit {
            None => Admission::allow(None),
            Some(RateLimit::Static(window)) => self.check_static(window).await,
            Some(RateLimit::Dynamic(dynamic)) => match probe_status(dynamic).await {
                Ok(status) if status.remaining <= 0 => {
                    let wait = (status.reset - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(remaining = status.remaining, ?wait, "can_make_request: dynamic quota exhausted");
                    Admission::deny(wait)
                }
                Ok(_) => Admission::allow(None),
                Err(e) => match &dynamic.fallback {
                    Some(window) => {
                        warn!(error = %e, "Rate status probe failed, using static fallback");
                        self.check_static(window).await
                    }
                    None => {
                        warn!(error = %e, "Rate status probe failed, allowing request");
                        Admission::allow(None)
                    }
                },
            },
        }
    }

    async fn check_static(&self, window: &StaticRateLimitConfig) -> Admission {
        let key = &self.config.id;
        match self.store.get_count(key).await {
            Ok(count) if count >= window.max_requests => {
                let wait = match self.store.get_ttl(key).await {
                    Ok(ttl) => ttl,
                    Err(e) => {
                        warn!(error = %e, "Failed to read window TTL");
                        window.interval()
                    }
                };
                debug!(count, ?wait, "check_static: window full");
                Admission::deny(wait)
            }
            Ok(_) => Admission::allow(Some(window.clone())),
            Err(e) => {
                warn!(error = %e, "Rate limit store unavailable, allowing request");
                self.events.error("admission", &e.to_string());
                Admission::allow(Some(window.clone()))
            }
        }
    }

    async fn execute(self: Arc<Self>, request: QueuedRequest) {
        let id = request.id.clone();
        let queue_time = request.enqueued_at.elapsed();
        let active = {
            let mut state = self.state();
            state.stats.record_queue_time(queue_time);
            state.active
        };
        debug!(%id, ?queue_time, "execute: started");
        self.events.request_started(&id, queue_time.as_millis() as u64, active);

        let retry = &self.config.retry;
        let started = Instant::now();
        let mut retries = 0u32;

        let outcome = loop {
            let (err, panicked) = match AssertUnwindSafe(request.attempt()).catch_unwind().await {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(e)) => (e, false),
                Err(payload) => (WorkError::new("Panic", panic_message(payload.as_ref())), true),
            };

            let attempts = retries + 1;
            let retryable = !panicked && request.classifier.is_retryable(&err, retry);
            if !retryable || attempts >= retry.max_attempts() {
                debug!(%id, attempts, retryable, "execute: terminal failure");
                break Err((err, attempts));
            }

            let delay = backoff_delay(retries, retry);
            debug!(%id, attempts, ?delay, error = %err, "execute: retrying after backoff");
            self.state().stats.total_retries += 1;
            self.events
                .request_requeued(&id, attempts, delay.as_millis() as u64, &err.to_string());
            tokio::time::sleep(delay).await;
            retries += 1;
        };

        let execution_time = started.elapsed();
        let resolution = match outcome {
            Ok(value) => {
                self.state().stats.record_processed(execution_time);
                self.events
                    .request_completed(&id, execution_time.as_millis() as u64, retries);
                Ok(ScheduleResult {
                    value,
                    queue_time,
                    execution_time,
                    retries,
                })
            }
            Err((err, attempts)) => {
                self.state().stats.total_rejected += 1;
                self.events.request_failed(&id, &err.to_string(), attempts);
                Err(RateLimitError::Work(err))
            }
        };

        let resolver = {
            let mut state = self.state();
            state.active -= 1;
            state.pending.remove(&id)
        };
        if let Some(tx) = resolver {
            let _ = tx.send(resolution);
        }

        self.trigger_drain();
    }
}

/// Ask the probe for quota, turning a panic into an error
async fn probe_status(dynamic: &DynamicRateLimitConfig) -> eyre::Result<RateStatus> {
    match AssertUnwindSafe(dynamic.probe.status()).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(eyre::eyre!(
            "rate status probe panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Clears the drain flag when a pass ends, however it ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "work panicked".to_string()
    }
}

/// Pending outcome of a submitted request
#[derive(Debug)]
pub struct ScheduleHandle<T> {
    id: RequestId,
    rx: oneshot::Receiver<Resolution>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ScheduleHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T: 'static> Future for ScheduleHandle<T> {
    type Output = Result<ScheduleResult<T>, RateLimitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let resolution = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(resolution) => resolution,
        };
        Poll::Ready(match resolution {
            Ok(Ok(result)) => downcast(result),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RateLimitError::Internal(format!(
                "request {} was dropped before it resolved",
                self.id
            ))),
        })
    }
}

fn downcast<T: 'static>(result: ScheduleResult<Output>) -> Result<ScheduleResult<T>, RateLimitError> {
    let ScheduleResult {
        value,
        queue_time,
        execution_time,
        retries,
    } = result;
    let value = value
        .downcast::<T>()
        .map_err(|_| RateLimitError::Internal("result type mismatch".to_string()))?;
    Ok(ScheduleResult {
        value: *value,
        queue_time,
        execution_time,
        retries,
    })
}
