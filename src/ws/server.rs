//! Accepts WebSocket upgrades on a listening address and owns the live set
//! of [`Connection`]s, dispatching single-target and broadcast writes
//! without holding the registry mutex across any I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::metrics::MetricRegistry;

use super::connection::{spawn_pumps, Connection, ConnectionConfig, ConnectionId};
use super::handler::{Handler, UpgradeRequest};

/// Configuration for a [`ServerRegistry`]: where it listens, which HTTP
/// path it upgrades, and the per-connection tunables it applies to every
/// accepted connection.
#[derive(Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub upgrade_path: String,
    pub connection_config: ConnectionConfig,
    metrics: Option<MetricRegistry>,
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, upgrade_path: impl Into<String>) -> Self {
        Self {
            listen_addr,
            upgrade_path: upgrade_path.into(),
            connection_config: ConnectionConfig::default(),
            metrics: None,
        }
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Wires a [`MetricRegistry`] into the upgrade path: every successful
    /// upgrade records a `Count` and `Duration` sample keyed by the
    /// upgrade path (§2 — "C1 is injected into C3's upgrade path").
    pub fn with_metrics(mut self, metrics: MetricRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

struct Registry {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

/// Owns the live set of connections accepted on one listening address +
/// upgrade path. Construct with [`ServerRegistry::new`], drive it with
/// [`ServerRegistry::listen_and_serve`].
#[derive(Clone)]
pub struct ServerRegistry {
    inner: Arc<Registry>,
}

impl ServerRegistry {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            inner: Arc::new(Registry {
                config,
                handler,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Binds `config.listen_addr` and upgrades every inbound connection
    /// whose request path matches `config.upgrade_path`. Runs until the
    /// listener errors (e.g. the socket is closed out from under it).
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(self.inner.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.inner.config.listen_addr))?;
        log::info!(
            "listening on {} for upgrades at {}",
            self.inner.config.listen_addr,
            self.inner.config.upgrade_path
        );
        loop {
            let (tcp, peer) = listener.accept().await.context("accept failed")?;
            let registry = self.clone();
            tokio::spawn(async move {
                registry.handle_upgrade(tcp, peer).await;
            });
        }
    }

    async fn handle_upgrade(&self, tcp: TcpStream, peer: SocketAddr) {
        let local_port = tcp.local_addr().ok().map(|a| a.port());
        let upgrade_path = self.inner.config.upgrade_path.clone();
        let captured: Arc<Mutex<Option<UpgradeRequest>>> = Arc::new(Mutex::new(None));
        let captured_cb = Arc::clone(&captured);

        let callback = move |request: &Request, response: Response| {
            let path = request.uri().path().to_string();
            let headers = request
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            *captured_cb
                .lock()
                .expect("upgrade-request capture mutex poisoned") =
                Some(UpgradeRequest { path: path.clone(), headers });
            if path == upgrade_path {
                Ok(response)
            } else {
                let rejection: ErrorResponse = http::Response::builder()
                    .status(400)
                    .body(Some(format!("no handler for upgrade path {path}")))
                    .expect("building a static 400 response cannot fail");
                Err(rejection)
            }
        };

        let started = Instant::now();
        let limit = self.inner.config.connection_config.limit_message_bytes;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(limit))
            .max_frame_size(Some(limit));

        let stream = match tokio_tungstenite::accept_hdr_async_with_config(
            tcp,
            callback,
            Some(ws_config),
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                log::info!("upgrade from {peer} failed: {e}");
                return;
            }
        };

        let upgrade_request = captured
            .lock()
            .expect("upgrade-request capture mutex poisoned")
            .take()
            .unwrap_or_default();

        if let Some(metrics) = &self.inner.config.metrics {
            metrics.count(&upgrade_request.path);
            metrics.duration(&upgrade_request.path, started.elapsed());
        }

        let id = ConnectionId::new(local_port, Some(peer));
        let (open_done_tx, open_done_rx) = tokio::sync::oneshot::channel();
        let connection = spawn_pumps(
            stream,
            id.clone(),
            self.inner.config.connection_config,
            Arc::clone(&self.inner.handler),
            Some(open_done_rx),
        );

        self.inner
            .connections
            .lock()
            .expect("connection registry mutex poisoned")
            .insert(id.clone(), connection.clone());

        // The reader pump parks on `open_done_rx` before dispatching its
        // first frame, so `on_open` always happens-before every
        // `on_message` (§4.2/§5) even though it runs in its own task.
        let handler = Arc::clone(&self.inner.handler);
        let open_id = id.clone();
        tokio::spawn(async move {
            handler.on_open(open_id, upgrade_request).await;
            let _ = open_done_tx.send(());
        });

        let registry = self.clone();
        tokio::spawn(async move {
            connection.closed().await;
            registry
                .inner
                .connections
                .lock()
                .expect("connection registry mutex poisoned")
                .remove(&id);
            registry.inner.handler.on_close(id).await;
        });
    }

    /// Enqueues a text frame to one connection. No-op if `id` isn't
    /// currently registered.
    pub async fn write(&self, id: &ConnectionId, text: &str) {
        let conn = self.get_connection(id);
        if let Some(conn) = conn {
            conn.write(text).await;
        }
    }

    /// Enqueues a binary frame to one connection. No-op if `id` isn't
    /// currently registered.
    pub async fn write_bytes(&self, id: &ConnectionId, payload: impl Into<bytes::Bytes>) {
        let conn = self.get_connection(id);
        if let Some(conn) = conn {
            conn.write_bytes(payload).await;
        }
    }

    /// Dispatches a text frame to every currently registered connection,
    /// each from its own task so one slow/backed-up recipient cannot
    /// delay the others.
    pub fn write_all(&self, text: &str) {
        for conn in self.snapshot() {
            let text = text.to_string();
            tokio::spawn(async move { conn.write(&text).await });
        }
    }

    /// Dispatches a binary frame to every currently registered connection.
    /// The payload is shared as one [`bytes::Bytes`] buffer across every
    /// recipient's task rather than cloned per connection. See
    /// [`ServerRegistry::write_all`] for the per-recipient fan-out.
    pub fn write_bytes_all(&self, payload: impl Into<bytes::Bytes>) {
        let payload = payload.into();
        for conn in self.snapshot() {
            let payload = payload.clone();
            tokio::spawn(async move { conn.write_bytes(payload).await });
        }
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.inner
            .connections
            .lock()
            .expect("connection registry mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .lock()
            .expect("connection registry mutex poisoned")
            .get(id)
            .cloned()
    }

    pub fn get_number_connections(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("connection registry mutex poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::handler::{Ignorer, MessageType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn free_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn empty_registry_has_no_connections() {
        let registry = ServerRegistry::new(
            ServerConfig::new(free_addr(), "/ws"),
            Arc::new(Ignorer),
        );
        assert_eq!(registry.get_number_connections(), 0);
        assert!(registry.get_connection(&ConnectionId::nil()).is_none());
    }

    struct EchoHandler {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Handler for EchoHandler {
        async fn on_open(&self, _id: ConnectionId, _req: UpgradeRequest) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_message(&self, payload: Vec<u8>, kind: MessageType, id: ConnectionId) {
            let _ = (payload, kind, id);
        }

        async fn on_close(&self, _id: ConnectionId) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn echo_server_accepts_a_connection_and_tracks_lifecycle() {
        let handler = Arc::new(EchoHandler {
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let registry = ServerRegistry::new(
            ServerConfig::new(free_addr(), "/echo"),
            Arc::clone(&handler) as Arc<dyn Handler>,
        );

        let listener = TcpListener::bind(registry.inner.config.listen_addr)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry_with_addr = ServerRegistry::new(
            ServerConfig::new(addr, "/echo"),
            Arc::clone(&handler) as Arc<dyn Handler>,
        );
        let serving = registry_with_addr.clone();
        tokio::spawn(async move {
            let _ = serving.listen_and_serve().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = crate::ws::client::connect(
            &format!("ws://{addr}/echo"),
            Arc::new(Ignorer),
            ConnectionConfig::default(),
            crate::ws::client::TlsOptions::default(),
        )
        .await
        .expect("client connect");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry_with_addr.get_number_connections(), 1);
        assert_eq!(handler.opens.load(Ordering::SeqCst), 1);

        client.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry_with_addr.get_number_connections(), 0);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }
}
