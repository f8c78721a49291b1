//! Event types for limiter activity
//!
//! These events represent all observable activity in a rate limiter:
//! - Request lifecycle (queued, started, completed, failed)
//! - Retries and deadline expiry
//! - Rate-limit waits and internal errors

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Core event enum - the vocabulary of limiter activity
///
/// Serialized as `{"type": "...", "data": {...}}` using the wire names
/// (`request:queued`, `rate:limited`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LimiterEvent {
    /// The admission check denied; the drain loop is waiting
    #[serde(rename = "rate:limited")]
    RateLimited {
        limiter_id: String,
        wait_ms: u64,
        queue_size: usize,
    },

    /// A request entered the queue
    #[serde(rename = "request:queued")]
    RequestQueued {
        limiter_id: String,
        request_id: String,
        priority: i32,
        queue_size: usize,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, serde_json::Value>,
    },

    /// A request was admitted and began executing
    #[serde(rename = "request:started")]
    RequestStarted {
        limiter_id: String,
        request_id: String,
        queue_time_ms: u64,
        active: usize,
    },

    /// A request finished successfully
    #[serde(rename = "request:completed")]
    RequestCompleted {
        limiter_id: String,
        request_id: String,
        execution_time_ms: u64,
        retries: u32,
    },

    /// A request failed terminally
    #[serde(rename = "request:failed")]
    RequestFailed {
        limiter_id: String,
        request_id: String,
        error: String,
        attempts: u32,
    },

    /// A failed attempt will be retried after a delay
    #[serde(rename = "request:requeued")]
    RequestRequeued {
        limiter_id: String,
        request_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A queued request passed its deadline
    #[serde(rename = "request:expired")]
    RequestExpired { limiter_id: String, request_id: String },

    /// Something went wrong inside the limiter
    #[serde(rename = "error")]
    Error {
        limiter_id: String,
        context: String,
        message: String,
    },
}

impl LimiterEvent {
    /// Wire name of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate:limited",
            Self::RequestQueued { .. } => "request:queued",
            Self::RequestStarted { .. } => "request:started",
            Self::RequestCompleted { .. } => "request:completed",
            Self::RequestFailed { .. } => "request:failed",
            Self::RequestRequeued { .. } => "request:requeued",
            Self::RequestExpired { .. } => "request:expired",
            Self::Error { .. } => "error",
        }
    }

    /// Limiter that emitted this event
    pub fn limiter_id(&self) -> &str {
        match self {
            Self::RateLimited { limiter_id, .. }
            | Self::RequestQueued { limiter_id, .. }
            | Self::RequestStarted { limiter_id, .. }
            | Self::RequestCompleted { limiter_id, .. }
            | Self::RequestFailed { limiter_id, .. }
            | Self::RequestRequeued { limiter_id, .. }
            | Self::RequestExpired { limiter_id, .. }
            | Self::Error { limiter_id, .. } => limiter_id,
        }
    }

    /// Request this event is about, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestQueued { request_id, .. }
            | Self::RequestStarted { request_id, .. }
            | Self::RequestCompleted { request_id, .. }
            | Self::RequestFailed { request_id, .. }
            | Self::RequestRequeued { request_id, .. }
            | Self::RequestExpired { request_id, .. } => Some(request_id),
            Self::RateLimited { .. } | Self::Error { .. } => None,
        }
    }

    /// True for events that end a request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RequestCompleted { .. } | Self::RequestFailed { .. } | Self::RequestExpired { .. }
        )
    }
}

/// Event wrapped with a timestamp for JSON-lines output
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LimiterEvent,
}

impl EventLogEntry {
    pub fn now(event: LimiterEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
