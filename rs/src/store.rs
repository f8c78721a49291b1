//! The store contract consumed by rate limiters

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Request-count accounting with TTL windows
///
/// `increment` must be atomic from the store's point of view: two limiters
/// sharing a key may call it concurrently.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current count in the live window for `key` (0 if none)
    async fn get_count(&self, key: &str) -> StoreResult<u64>;

    /// Increment the counter for `key`, opening a window of `ttl` if none is live
    ///
    /// Returns the count after incrementing. The TTL is set only when the
    /// window is created.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Time left in the live window for `key` (zero if none)
    async fn get_ttl(&self, key: &str) -> StoreResult<Duration>;

    /// Drop the window for `key`
    async fn reset(&self, key: &str) -> StoreResult<()>;

    /// Release resources; later calls fail with [`StoreError::Closed`](crate::StoreError::Closed)
    async fn close(&self) -> StoreResult<()>;
}
