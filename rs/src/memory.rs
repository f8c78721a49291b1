//! In-process store implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::RateLimitStore;

/// A counter and the instant its window closes
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: Instant,
}

impl Window {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Windows = Arc<Mutex<HashMap<String, Window>>>;

/// In-memory store for a single process
///
/// Expiry is enforced passively on every access. [`MemoryStore::with_sweep`]
/// additionally spawns a task that evicts dead windows so idle keys don't
/// accumulate.
pub struct MemoryStore {
    windows: Windows,
    closed: AtomicBool,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store without an active sweep
    pub fn new() -> Self {
        debug!("MemoryStore::new: called");
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Create a store that evicts expired windows every `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_sweep(interval: Duration) -> Self {
        debug!(?interval, "MemoryStore::with_sweep: called");
        let store = Self::new();
        let windows = Arc::clone(&store.windows);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut windows = windows.lock().await;
                let before = windows.len();
                windows.retain(|_, w| w.is_live(now));
                let evicted = before - windows.len();
                if evicted > 0 {
                    debug!(evicted, "MemoryStore: sweep evicted expired windows");
                }
            }
        });
        if let Ok(mut sweeper) = store.sweeper.lock() {
            *sweeper = Some(handle);
        }
        store
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn stop_sweep(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                debug!("MemoryStore: stopping sweep task");
                handle.abort();
            }
        }
    }

    /// Number of live windows (debug accessor, not part of the store contract)
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.windows.lock().await.values().filter(|w| w.is_live(now)).count()
    }

    /// True if no window is live
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Keys with a live window, sorted
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .windows
            .lock()
            .await
            .iter()
            .filter(|(_, w)| w.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get_count(&self, key: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let windows = self.windows.lock().await;
        Ok(windows.get(key).filter(|w| w.is_live(now)).map(|w| w.count).unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + ttl,
        });
        if !window.is_live(now) {
            debug!(%key, "MemoryStore::increment: window expired, starting new window");
            *window = Window {
                count: 0,
                expires_at: now + ttl,
            };
        }
        window.count += 1;
        Ok(window.count)
    }

    async fn get_ttl(&self, key: &str) -> StoreResult<Duration> {
        self.ensure_open()?;
        let now = Instant::now();
        let windows = self.windows.lock().await;
        Ok(windows
            .get(key)
            .map(|w| w.expires_at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO))
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        debug!(%key, "MemoryStore::reset: called");
        self.windows.lock().await.remove(key);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("MemoryStore::close: already closed");
            return Ok(());
        }
        self.stop_sweep();
        self.windows.lock().await.clear();
        info!("MemoryStore closed");
        Ok(())
    }
}
