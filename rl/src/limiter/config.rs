//! Rate limiter configuration

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Fixed-window request budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaticRateLimitConfig {
    /// Max requests per window
    pub max_requests: u64,

    /// Window length in milliseconds
    pub interval_ms: u64,
}

impl StaticRateLimitConfig {
    pub fn new(max_requests: u64, interval: Duration) -> Self {
        Self {
            max_requests,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Get the window as a Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Remaining quota reported by an external source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStatus {
    pub remaining: i64,

    /// When the external window resets
    pub reset: DateTime<Utc>,

    pub limit: Option<u64>,
}

/// Source of [`RateStatus`], queried on every admission check
#[async_trait]
pub trait RateStatusProbe: Send + Sync {
    async fn status(&self) -> eyre::Result<RateStatus>;
}

struct FnProbe<F>(F);

#[async_trait]
impl<F, Fut> RateStatusProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<RateStatus>> + Send + 'static,
{
    async fn status(&self) -> eyre::Result<RateStatus> {
        (self.0)().await
    }
}

/// Wrap an async closure as a probe
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn RateStatusProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<RateStatus>> + Send + 'static,
{
    Arc::new(FnProbe(f))
}

/// Externally driven limiting with an optional local fallback
#[derive(Clone)]
pub struct DynamicRateLimitConfig {
    pub probe: Arc<dyn RateStatusProbe>,

    /// Used when the probe fails
    pub fallback: Option<StaticRateLimitConfig>,
}

impl fmt::Debug for DynamicRateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicRateLimitConfig")
            .field("probe", &"<probe>")
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// How admission is limited
#[derive(Debug, Clone)]
pub enum RateLimit {
    Static(StaticRateLimitConfig),
    Dynamic(DynamicRateLimitConfig),
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Limiter identifier; also the store key
    pub id: String,

    /// No limit means every admission check passes
    pub limit: Option<RateLimit>,

    /// Unbounded when None
    pub max_queue_size: Option<usize>,

    pub retry: RetryConfig,

    /// Max simultaneously executing requests
    pub max_concurrent: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            limit: None,
            max_queue_size: None,
            retry: RetryConfig::default(),
            max_concurrent: 1,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_static_limit(mut self, max_requests: u64, interval: Duration) -> Self {
        self.limit = Some(RateLimit::Static(StaticRateLimitConfig::new(max_requests, interval)));
        self
    }

    pub fn with_dynamic_limit(
        mut self,
        probe: Arc<dyn RateStatusProbe>,
        fallback: Option<StaticRateLimitConfig>,
    ) -> Self {
        self.limit = Some(RateLimit::Dynamic(DynamicRateLimitConfig { probe, fallback }));
        self
    }

    pub fn with_max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = Some(max);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}
