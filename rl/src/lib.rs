//! RateLimiter - priority-queued API rate limiting
//!
//! Mediates access to a throughput-constrained external resource: callers
//! submit units of work, the limiter decides when each may run, runs it under
//! a concurrency cap, and retries transient failures with backoff.
//!
//! # Core Concepts
//!
//! - **Priority Queue**: higher priority drains first, FIFO within a tier,
//!   with deadline-based expiry while queued
//! - **Admission**: a fixed-window count in a [`ratestore::RateLimitStore`], or an
//!   external quota probe with a static fallback
//! - **Bounded Concurrency**: at most `max_concurrent` units execute at once
//! - **Retry**: Full Jitter exponential backoff for retryable failures
//! - **Events**: every state change is observable; failing listeners are isolated
//!
//! # Modules
//!
//! - [`limiter`] - queue, admission, drain loop, execution
//! - [`retry`] - retry classification and backoff delays
//! - [`events`] - event types and the listener bus
//! - [`config`] - file configuration and loading
//! - [`cli`] - command-line interface
//! - [`simulate`] - synthetic workloads for the CLI

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod retry;
pub mod simulate;

// Re-export commonly used types
pub use config::{Config, LimiterSettings, SimulationConfig};
pub use error::{RateLimitError, WorkError};
pub use events::{EventBus, EventEmitter, EventLogEntry, LimiterEvent, ListenerId, Subscription};
pub use limiter::{
    Admission, DynamicRateLimitConfig, PriorityQueue, QueuedRequest, RateLimit, RateLimiter, RateLimiterConfig,
    RateLimiterStats, RateStatus, RateStatusProbe, RequestId, ScheduleHandle, ScheduleOptions, ScheduleResult,
    StaticRateLimitConfig, probe_fn,
};
pub use ratestore::{MemoryStore, RateLimitStore, StoreError};
pub use retry::{RetryClassifier, RetryConfig, backoff_delay, backoff_delay_with, is_retryable};
