//! RateStore - request-count accounting for rate limiters
//!
//! A store tracks one counter per key inside a fixed TTL window. The first
//! increment opens the window; later increments within it never extend the
//! TTL; once the window elapses the next increment starts again at 1.
//!
//! Implementations are interchangeable: the in-process [`MemoryStore`]
//! enforces expiry itself, a distributed backend would rely on native key
//! expiry. Only the distribution guarantees differ.
//!
//! # Example
//!
//! ```ignore
//! use ratestore::{MemoryStore, RateLimitStore};
//! use std::time::Duration;
//!
//! let store = MemoryStore::new();
//! store.increment("api", Duration::from_secs(60)).await?;
//! assert_eq!(store.get_count("api").await?, 1);
//! ```

mod error;
mod memory;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::RateLimitStore;
