//! The capability set a WebSocket consumer implements: `OnOpen`, `OnMessage`,
//! `OnClose`. A no-op [`Ignorer`] satisfies all three and is the default for
//! callers that only care about one of them.

use async_trait::async_trait;

use super::connection::ConnectionId;

/// Classifies an inbound frame as the client sent it. Ping/Pong frames are
/// handled transparently by the connection runtime and never reach here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// The headers and path observed during the upgrade handshake, handed to
/// [`Handler::on_open`]. Routing on this is the embedding application's job
/// (§1 — HTTP routing is out of scope here); the registry only ever binds
/// one upgrade path, so this mostly carries headers of interest (auth
/// tokens, protocol negotiation, etc).
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Callbacks invoked by [`super::server::ServerRegistry`] (and, for
/// `on_message`, by a bare client [`super::connection::Connection`]) as a
/// connection moves through its lifecycle.
///
/// For any given connection id, `on_open` happens-before every
/// `on_message`, which happens-before `on_close` — each fires exactly once
/// except `on_message`, which fires once per inbound frame. Implementations
/// must be safe to invoke concurrently across distinct connection ids (the
/// registry never serializes calls across connections), and should not
/// block for long: a slow handler only ever delays its own connection's
/// pumps, but a handler that never returns will wedge that connection's
/// reader permanently.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invoked once, after the connection is registered and before any
    /// `on_message` call for it.
    async fn on_open(&self, _id: ConnectionId, _req: UpgradeRequest) {}

    /// Invoked once per inbound text/binary frame, from a fresh task so a
    /// slow handler cannot stall the connection's reader loop.
    async fn on_message(&self, _payload: Vec<u8>, _kind: MessageType, _id: ConnectionId) {}

    /// Invoked once, after the connection has been removed from the
    /// registry and both its pumps have exited.
    async fn on_close(&self, _id: ConnectionId) {}
}

/// A [`Handler`] that does nothing for all three callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ignorer;

#[async_trait]
impl Handler for Ignorer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ignorer_does_not_panic() {
        let h = Ignorer;
        h.on_open(ConnectionId::nil(), UpgradeRequest::default()).await;
        h.on_message(vec![1, 2, 3], MessageType::Binary, ConnectionId::nil())
            .await;
        h.on_close(ConnectionId::nil()).await;
    }
}
