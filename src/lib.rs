//! Switchyard: a WebSocket connection runtime, a Kafka consumer-group broker
//! client, and a sampled-percentile metric registry.
//!
//! The three subsystems share a common failure model — graceful teardown via
//! a cancellation token, fixed-timeout write ingress, and shared state
//! protected by fine-grained mutexes — but are otherwise independent and can
//! be used alone.
//!
//! - [`ws`] — a bidirectional WebSocket connection runtime (heartbeat,
//!   single-writer invariant) and a server registry that multiplexes
//!   broadcasts across a live set of connections.
//! - [`broker`] — a Kafka consumer-group client exposing a synchronous
//!   `read_message(timeout)` over a per-partition fanout, and a producer
//!   with bounded enqueue and fire-and-forget delivery drainers.
//! - [`metrics`] — a per-key count/duration accumulator with atomic
//!   snapshot rotation and percentile queries over an order-statistic tree.

pub mod broker;
pub mod metrics;
pub mod ws;
