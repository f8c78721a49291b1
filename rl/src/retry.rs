//! Retry classification and backoff delays
//!
//! Delays use Full Jitter exponential backoff so that many callers failing
//! at once don't retry in lockstep.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::WorkError;

/// Substrings that mark a failure as transient
const TRANSIENT_MARKERS: [&str; 5] = ["timeout", "connection", "refused", "network", "socket"];

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any delay in milliseconds
    pub max_delay_ms: u64,

    /// Jitter factor, 0.0 to 1.0
    pub jitter: f64,

    /// Error categories that are worth retrying
    pub retryable_errors: Vec<String>,

    /// Result status codes that are worth retrying
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.1,
            retryable_errors: vec!["timeout".to_string(), "network".to_string(), "connection".to_string()],
            retryable_statuses: BTreeSet::from([429, 500, 502, 503, 504]),
        }
    }
}

impl RetryConfig {
    /// Get the base delay as a Duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Get the max delay as a Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Total attempts a unit of work gets
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Retry configuration that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// How a failed attempt is judged retryable
#[derive(Clone, Default)]
pub enum RetryClassifier {
    /// Category and status rules from [`RetryConfig`]
    #[default]
    Default,

    /// Caller-supplied rule for one unit of work
    Custom(Arc<dyn Fn(&WorkError) -> bool + Send + Sync>),
}

impl RetryClassifier {
    /// Wrap a closure as a classifier
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&WorkError) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn is_retryable(&self, err: &WorkError, config: &RetryConfig) -> bool {
        match self {
            Self::Default => is_retryable(err, config),
            Self::Custom(f) => f(err),
        }
    }
}

impl fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Check whether a failed attempt should be retried
///
/// Retryable when the category names a configured retryable category, when
/// the category or message looks transient (only if any categories are
/// configured), or when the attached status is a configured retryable status.
pub fn is_retryable(err: &WorkError, config: &RetryConfig) -> bool {
    if err.status_code().is_some_and(|code| config.retryable_statuses.contains(&code)) {
        return true;
    }

    if config.retryable_errors.is_empty() {
        return false;
    }

    let category = err.category().to_lowercase();
    if config.retryable_errors.iter().any(|c| c.to_lowercase() == category) {
        return true;
    }

    let message = err.message().to_lowercase();
    TRANSIENT_MARKERS
        .iter()
        .any(|marker| category.contains(marker) || message.contains(marker))
}

/// Backoff delay before retry number `attempt` (0-based), with a random jitter sample
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let sample: f64 = rand::rng().random();
    backoff_delay_with(attempt, config, sample)
}

/// Backoff delay using an explicit jitter sample in `[0, 1)`
///
/// `exp = min(max, base * 2^attempt)`, then
/// `exp * (1 - jitter/2) + sample * jitter * exp`, clamped to `[0, max]`.
pub fn backoff_delay_with(attempt: u32, config: &RetryConfig, sample: f64) -> Duration {
    let base = config.base_delay().as_secs_f64();
    let max = config.max_delay().as_secs_f64();
    let jitter = config.jitter.clamp(0.0, 1.0);
    let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.0 };

    let exp = (base * 2f64.powi(attempt.min(1023) as i32)).min(max);
    let delay = exp * (1.0 - jitter / 2.0) + sample * jitter * exp;

    Duration::from_secs_f64(delay.clamp(0.0, max))
}
