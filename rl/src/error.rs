//! Error types for scheduled work and the limiter

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Failure raised by a unit of work
///
/// Carries a category (used for retry classification), a message, and an
/// optional numeric status. Any `std::error::Error` converts into a
/// `WorkError` with its type name as the category, so `?` works inside
/// scheduled closures.
#[derive(Clone)]
pub struct WorkError {
    category: String,
    message: String,
    status: Option<u16>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl WorkError {
    /// Create a work error with an explicit category
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create a work error carrying a response status code
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new("StatusError", message).with_status(code)
    }

    /// Attach a status code
    pub fn with_status(mut self, code: u16) -> Self {
        self.status = Some(code);
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    /// The wrapped error, when converted from one
    pub fn source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl<E> From<E> for WorkError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            category: short_type_name::<E>().to_string(),
            message: err.to_string(),
            status: None,
            source: Some(Arc::new(err)),
        }
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} ({}): {}", self.category, code, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

impl fmt::Debug for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkError")
            .field("category", &self.category)
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

/// `std::io::error::Error` -> `Error`, `foo::Bar<T>` -> `Bar`
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Terminal errors surfaced to `schedule` callers
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("Queue is full (max {max} pending requests)")]
    QueueFull { max: usize },

    #[error("Rate limiter has been destroyed")]
    Destroyed,

    #[error("Request {id} expired before it could run")]
    Expired { id: String },

    #[error("Request {id} was cancelled")]
    Cancelled { id: String },

    #[error("{0}")]
    Work(WorkError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimitError {
    /// Queue-full and destroyed errors are raised before anything is enqueued
    pub fn is_admission_error(&self) -> bool {
        matches!(self, RateLimitError::QueueFull { .. } | RateLimitError::Destroyed)
    }

    /// The unit of work's own error, if that is what ended the request
    pub fn work_error(&self) -> Option<&WorkError> {
        match self {
            RateLimitError::Work(err) => Some(err),
            _ => None,
        }
    }
}
