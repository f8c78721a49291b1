//! Store error types

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Store is closed")]
    Closed,

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if the store has been closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
