//! Event surface for limiter observability
//!
//! Every state change in a limiter emits a [`LimiterEvent`]:
//!
//! ```text
//!   schedule ──► request:queued
//!   drain    ──► rate:limited | request:expired
//!   execute  ──► request:started ──► request:requeued* ──► request:completed
//!                                                     └──► request:failed
//!   internal ──► error
//! ```
//!
//! Listeners registered with `on` run inline and are isolated from one
//! another; async consumers subscribe to the broadcast channel.

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, Listener, ListenerId, Subscription};
pub use types::{EventLogEntry, LimiterEvent};
