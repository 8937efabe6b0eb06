//! A bidirectional WebSocket connection runtime (heartbeat, single-writer
//! invariant) and a server registry that multiplexes broadcasts across a
//! live set of connections.
//!
//! - [`connection`] — one connection's reader/writer pumps, its write
//!   channel, and its cancellation-safe close.
//! - [`client`] — dials a URL and adopts the negotiated transport.
//! - [`server`] — accepts upgrade handshakes and owns the live connection
//!   set.
//! - [`handler`] — the `OnOpen`/`OnMessage`/`OnClose` capability set
//!   consumers implement.

pub mod client;
pub mod connection;
pub mod handler;
pub mod server;

pub use client::{connect, TlsOptions};
pub use connection::{ConfigError, Connection, ConnectionConfig, ConnectionId};
pub use handler::{Handler, Ignorer, MessageType, UpgradeRequest};
pub use server::{ServerConfig, ServerRegistry};
