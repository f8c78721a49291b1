//! Rate limiter for calls to a throughput-constrained resource
//!
//! Manages execution with priority queuing, concurrency limits,
//! rate limiting, and retry in a single component.

mod config;
mod core;
mod queue;
mod stats;

pub use config::{
    DynamicRateLimitConfig, RateLimit, RateLimiterConfig, RateStatus, RateStatusProbe, StaticRateLimitConfig, probe_fn,
};
pub use core::{Admission, RateLimiter, ScheduleHandle};
pub use queue::{PriorityQueue, QueuedRequest, RequestId, ScheduleOptions};
pub use stats::{RateLimiterStats, ScheduleResult};
