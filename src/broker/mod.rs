//! Kafka consumer-group session (C4) and producer (C5) clients.
//!
//! - [`consumer`] — joins a group, fans out `read_message(timeout)` to
//!   per-partition dispatchers, commits on successful handoff.
//! - [`producer`] — enqueues messages with an opaque id, correlating
//!   delivery success/failure back to it.
//! - [`error`] — the typed error enums callers match on.

mod consumer;
mod error;
mod producer;

pub use consumer::{Consumer, ConsumerConfig, Offset, FOREVER};
pub use error::{ConsumerError, ProducerError};
pub use producer::{Acks, Producer, ProducerConfig};
