//! One bidirectional WebSocket connection: a reader pump, a writer pump,
//! and the single write channel that gives the writer exclusive ownership
//! of the transport's write side.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;

use super::handler::{Handler, MessageType};

/// A human-inspectable identifier, unique across all currently live
/// connections on a host. Formatted `[ws|:<localPort>|<remoteAddr>]`, or
/// `[ws|nil]` when no transport address could be determined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub(crate) fn new(local_port: Option<u16>, remote_addr: Option<SocketAddr>) -> Self {
        match (local_port, remote_addr) {
            (Some(port), Some(addr)) => Self(format!("[ws|:{port}|{addr}]")),
            _ => Self::nil(),
        }
    }

    /// The id used when no transport address is associated with a
    /// connection (the `[ws|nil]` form from the source's `genConnId`).
    pub fn nil() -> Self {
        Self("[ws|nil]".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raised when a [`ConnectionConfig`] violates the heartbeat contract.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ping_period ({ping_period:?}) must be > 0 and < pong_wait ({pong_wait:?})")]
    InvalidPingPeriod {
        ping_period: Duration,
        pong_wait: Duration,
    },
}

/// Per-connection tunables applied at construction.
///
/// Defaults mirror the source's package-scope `wsConfig`: `WriteWait` 60s,
/// `PongWait` 60s, `PingPeriod` 25s, `LimitMessageBytes` 65536.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub limit_message_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(60),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(25),
            limit_message_bytes: 65536,
        }
    }
}

impl ConnectionConfig {
    pub fn with_write_wait(mut self, d: Duration) -> Self {
        self.write_wait = d;
        self
    }

    pub fn with_pong_wait(mut self, d: Duration) -> Self {
        self.pong_wait = d;
        self
    }

    pub fn with_ping_period(mut self, d: Duration) -> Self {
        self.ping_period = d;
        self
    }

    pub fn with_limit_message_bytes(mut self, n: usize) -> Self {
        self.limit_message_bytes = n;
        self
    }

    /// Rejects configurations that violate `0 < PingPeriod < PongWait`: a
    /// ping period of zero would busy-loop the writer, and one at or past
    /// `pong_wait` can never beat the peer's deadline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(ConfigError::InvalidPingPeriod {
                ping_period: self.ping_period,
                pong_wait: self.pong_wait,
            });
        }
        Ok(())
    }
}

enum WriteItem {
    Frame { payload: Bytes, binary: bool },
    Pong(Vec<u8>),
}

/// A live WebSocket connection handle.
///
/// Cloning is cheap (an `Arc`-backed write channel and cancellation token);
/// every clone refers to the same underlying connection. There is exactly
/// one writer task per connection — all `write`/`write_bytes` calls funnel
/// through its bounded channel, so callers never race each other onto the
/// transport.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    write_tx: mpsc::Sender<WriteItem>,
    write_wait: Duration,
    closed: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// `true` iff the closed-signal has fired (locally, by the peer, or by
    /// a read/write/ping failure). Once true it never becomes false again.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Triggers shutdown of both pumps. Idempotent — a second call is a
    /// no-op.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the closed-signal has fired, by any cause. Used by
    /// [`super::server::ServerRegistry`] to know when to remove a
    /// connection and fire `on_close`.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Enqueues a UTF-8 text frame. Blocks until the frame is enqueued, the
    /// connection closes, or `write_wait` elapses; in the latter two cases
    /// this returns without error and the frame is silently dropped (§7 —
    /// low-priority broadcast traffic, observable only via [`Connection::is_closed`]).
    pub async fn write(&self, text: &str) {
        self.enqueue(Bytes::copy_from_slice(text.as_bytes()), false).await;
    }

    /// Enqueues a binary frame. Accepts anything cheaply convertible to
    /// [`Bytes`] so a broadcast fan-out (`ServerRegistry::write_bytes_all`)
    /// can share one buffer across every recipient instead of cloning the
    /// payload per connection. See [`Connection::write`] for the drop
    /// semantics on timeout/close.
    pub async fn write_bytes(&self, payload: impl Into<Bytes>) {
        self.enqueue(payload.into(), true).await;
    }

    async fn enqueue(&self, payload: Bytes, binary: bool) {
        if self.closed.is_cancelled() {
            return;
        }
        let item = WriteItem::Frame { payload, binary };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {}
            res = self.write_tx.send(item) => {
                if res.is_err() {
                    log::debug!("{} write channel closed, frame dropped", self.id);
                }
            }
            () = tokio::time::sleep(self.write_wait) => {
                log::warn!("{} timeout enqueuing write, frame dropped", self.id);
            }
        }
    }
}

/// Applies `config.limit_message_bytes` to the handshake and spawns the
/// reader/writer pumps, returning the live [`Connection`] handle.
///
/// `open_barrier`, when given, holds the reader pump's first frame until it
/// resolves — [`super::server::ServerRegistry`] uses this to guarantee
/// `on_open` happens-before every `on_message` (§4.2/§5) without blocking
/// the upgrade path on the handler callback itself. Client connections
/// (`super::client::connect`) have no such ordering requirement and pass
/// `None`.
///
/// Generic over the transport so both the TLS-capable client stream
/// (`MaybeTlsStream<TcpStream>`) and the plain server-side `TcpStream` share
/// one pump implementation.
pub(crate) fn spawn_pumps<S>(
    stream: WebSocketStream<S>,
    id: ConnectionId,
    config: ConnectionConfig,
    handler: Arc<dyn Handler>,
    open_barrier: Option<oneshot::Receiver<()>>,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write_tx, write_rx) = mpsc::channel(32);
    let closed = CancellationToken::new();
    let (sink, stream) = stream.split();

    tokio::spawn(writer_pump(
        sink,
        write_rx,
        config,
        closed.clone(),
        id.clone(),
    ));
    tokio::spawn(reader_pump(
        stream,
        write_tx.clone(),
        config,
        closed.clone(),
        handler,
        id.clone(),
        open_barrier,
    ));

    Connection {
        id,
        write_tx,
        write_wait: config.write_wait,
        closed,
    }
}

async fn reader_pump<S>(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    write_tx: mpsc::Sender<WriteItem>,
    config: ConnectionConfig,
    closed: CancellationToken,
    handler: Arc<dyn Handler>,
    id: ConnectionId,
    open_barrier: Option<oneshot::Receiver<()>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Some(barrier) = open_barrier {
        tokio::select! {
            biased;
            () = closed.cancelled() => return,
            _ = barrier => {}
        }
    }

    let mut deadline = Instant::now() + config.pong_wait;
    loop {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            () = closed.cancelled() => break,
            () = &mut sleep => {
                log::info!("{id} pong wait elapsed with no pong, closing");
                break;
            }
            frame = stream.next() => {
                match frame {
                    None => {
                        log::debug!("{id} read stream ended");
                        break;
                    }
                    Some(Err(e)) => {
                        log::info!("{id} read error: {e}");
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + config.pong_wait;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let pong: Vec<u8> = Vec::from(payload);
                        if write_tx.send(WriteItem::Pong(pong)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        let handler = Arc::clone(&handler);
                        let id = id.clone();
                        let payload = text.as_bytes().to_vec();
                        tokio::spawn(async move {
                            handler.on_message(payload, MessageType::Text, id).await;
                        });
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let handler = Arc::clone(&handler);
                        let id = id.clone();
                        let payload: Vec<u8> = Vec::from(data);
                        tokio::spawn(async move {
                            handler.on_message(payload, MessageType::Binary, id).await;
                        });
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::debug!("{id} received close frame");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frames only surface when reading manually; skip.
                    }
                }
            }
        }
    }
    closed.cancel();
}

async fn writer_pump<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    mut write_rx: mpsc::Receiver<WriteItem>,
    config: ConnectionConfig,
    closed: CancellationToken,
    id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(config.ping_period);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        let outcome = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            item = write_rx.recv() => {
                match item {
                    None => break,
                    Some(WriteItem::Frame { payload, binary }) => {
                        let msg = if binary {
                            Message::Binary(payload.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&payload).into_owned().into())
                        };
                        send_with_deadline(&mut sink, msg, config.write_wait).await
                    }
                    Some(WriteItem::Pong(payload)) => {
                        send_with_deadline(&mut sink, Message::Pong(payload.into()), config.write_wait).await
                    }
                }
            }
            _ = ticker.tick() => {
                send_with_deadline(&mut sink, Message::Ping(Vec::new().into()), config.write_wait).await
            }
        };
        if let Err(e) = outcome {
            log::info!("{id} write error: {e}");
            break;
        }
    }
    let _ = sink.close().await;
    closed.cancel();
    log::debug!("{id} writer pump returned");
}

async fn send_with_deadline<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    msg: Message,
    write_wait: Duration,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match tokio::time::timeout(write_wait, sink.send(msg)).await {
        Ok(result) => result,
        Err(_) => Err(tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write_wait elapsed",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_format_with_transport() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let id = ConnectionId::new(Some(54321), Some(addr));
        assert_eq!(id.as_str(), "[ws|:54321|127.0.0.1:9001]");
    }

    #[test]
    fn connection_id_nil_without_transport() {
        assert_eq!(ConnectionId::new(None, None).as_str(), "[ws|nil]");
        assert_eq!(ConnectionId::nil().as_str(), "[ws|nil]");
    }

    #[test]
    fn default_config_matches_source_defaults() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.write_wait, Duration::from_secs(60));
        assert_eq!(cfg.pong_wait, Duration::from_secs(60));
        assert_eq!(cfg.ping_period, Duration::from_secs(25));
        assert_eq!(cfg.limit_message_bytes, 65536);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_ping_period_is_rejected() {
        let cfg = ConnectionConfig::default().with_ping_period(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidPingPeriod { .. })));
    }

    #[test]
    fn ping_period_at_or_past_pong_wait_is_rejected() {
        let cfg = ConnectionConfig::default()
            .with_pong_wait(Duration::from_secs(10))
            .with_ping_period(Duration::from_secs(10));
        assert!(cfg.validate().is_err());

        let cfg2 = ConnectionConfig::default()
            .with_pong_wait(Duration::from_secs(10))
            .with_ping_period(Duration::from_secs(11));
        assert!(cfg2.validate().is_err());
    }
}
