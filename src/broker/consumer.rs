//! Consumer-group session (C4): joins the group, owns one dispatcher per
//! assigned partition, and serves `read_message(timeout)` by fanning a
//! request out to every live dispatcher and taking whichever answers first.
//!
//! `examples/original_source/kafka/consumer.go` never got past a stub over
//! `sarama` (`Read` is empty), so the session state machine below is built
//! directly against `rdkafka::consumer::StreamConsumer`, using the
//! `ConsumerContext` rebalance callbacks as the concrete `Joining` /
//! `Running` / `Reconnecting` triggers the stub only sketched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{Message as _, OwnedMessage};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset as KafkaOffset;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::error::ConsumerError;

/// Where a fresh consumer-group member should start reading on partitions
/// it has never committed an offset for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Kafka offset `-2`.
    Earliest,
    /// Kafka offset `-1`.
    Latest,
}

impl Offset {
    fn as_auto_offset_reset(self) -> &'static str {
        match self {
            Offset::Earliest => "earliest",
            Offset::Latest => "latest",
        }
    }
}

/// `ReadMessage(timeout<0)` in the original source means "wait forever",
/// mapped here to a long finite bound rather than a sentinel negative
/// duration (`Duration` can't hold one).
pub const FOREVER: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub bootstrap_servers: String,
    /// Comma-separated topic list (§6 "Topics list is a comma-separated
    /// string").
    pub topics: String,
    pub group_id: String,
    pub offset: Offset,
}

impl ConsumerConfig {
    pub fn new(
        bootstrap_servers: impl Into<String>,
        topics: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topics: topics.into(),
            group_id: group_id.into(),
            offset: Offset::Latest,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Joining,
    Running,
    Reconnecting,
    Stopped,
}

/// A request fanned out to every live partition dispatcher. `response` is a
/// single one-shot sender shared behind a mutex-guarded `Option`: whichever
/// dispatcher's message arrives first `take()`s it out and sends, which
/// guarantees exactly one dispatcher ever calls `oneshot::Sender::send` —
/// unlike a shared `mpsc` sender, a second dispatcher that loses the race
/// simply observes `None` and discards its message instead of parking a
/// buffered send that could still land after the caller stopped listening.
#[derive(Clone)]
struct PendingRequest {
    response: Arc<Mutex<Option<oneshot::Sender<OwnedMessage>>>>,
    cancelled: CancellationToken,
}

#[derive(Clone)]
struct PartitionHandle {
    request_tx: mpsc::UnboundedSender<PendingRequest>,
}

enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
}

/// `ConsumerContext` implementation whose `pre_rebalance`/`post_rebalance`
/// callbacks are the session loop's only signal that partition ownership
/// changed.
struct RebalanceContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    ready: Arc<Notify>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let _ = self
                .events
                .send(RebalanceEvent::Revoked(tpl_to_vec(tpl)));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let _ = self
                .events
                .send(RebalanceEvent::Assigned(tpl_to_vec(tpl)));
            self.ready.notify_waiters();
        }
    }
}

fn tpl_to_vec(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

struct Inner {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    partitions: RwLock<HashMap<(String, i32), PartitionHandle>>,
    state: Mutex<SessionState>,
    closed: CancellationToken,
}

/// Handle to a live consumer-group session. Construct with
/// [`Consumer::connect`], which blocks until the first partition assignment
/// (or an error) arrives, matching `Disconnected → Joining → Running`.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    pub async fn connect(config: ConsumerConfig) -> Result<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(Notify::new());
        let context = RebalanceContext {
            events: events_tx,
            ready: Arc::clone(&ready),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", config.offset.as_auto_offset_reset())
            .set("session.timeout.ms", "10000");

        let consumer: StreamConsumer<RebalanceContext> = client_config
            .create_with_context(context)
            .context("creating consumer-group client")?;

        let topics: Vec<&str> = config.topics.split(',').map(str::trim).collect();
        consumer
            .subscribe(&topics)
            .with_context(|| format!("subscribing to {}", config.topics))?;

        let consumer = Arc::new(consumer);
        let inner = Arc::new(Inner {
            consumer: Arc::clone(&consumer),
            partitions: RwLock::new(HashMap::new()),
            state: Mutex::new(SessionState::Joining),
            closed: CancellationToken::new(),
        });

        let demux_consumer = Arc::clone(&consumer);
        let demux_partitions = Arc::clone(&inner);
        let demux_closed = inner.closed.clone();
        tokio::spawn(async move {
            run_session(demux_consumer, demux_partitions, &mut events_rx, demux_closed).await;
        });

        // Joining -> Running happens on the first rebalance; an external
        // connection timeout would be an application-level wrapper around
        // this await (the setup call itself has no built-in timeout, mirroring
        // the original `Consume` blocking until `Setup`).
        ready.notified().await;

        Ok(Self { inner })
    }

    /// Returns exactly one message delivered to this caller within
    /// `timeout`, or [`ConsumerError::ReadMsgTimeout`]. `None` means "wait
    /// forever" (see [`FOREVER`]).
    pub async fn read_message(&self, timeout: Option<Duration>) -> Result<OwnedMessage, ConsumerError> {
        if self.inner.closed.is_cancelled() {
            return Err(ConsumerError::ReadClosedConsumer);
        }
        let timeout = timeout.unwrap_or(FOREVER);

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let response = Arc::new(Mutex::new(Some(tx)));

        let handles: Vec<PartitionHandle> = self
            .inner
            .partitions
            .read()
            .expect("partition map poisoned")
            .values()
            .cloned()
            .collect();

        for handle in handles {
            let req = PendingRequest {
                response: Arc::clone(&response),
                cancelled: cancel.clone(),
            };
            let _ = handle.request_tx.send(req);
        }

        let result = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(ConsumerError::ReadClosedConsumer),
            _ = tokio::time::sleep(timeout) => Err(ConsumerError::ReadMsgTimeout),
            msg = rx => msg.map_err(|_| ConsumerError::ReadMsgTimeout),
        };
        cancel.cancel();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Tears down the session. Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        *self
            .inner
            .state
            .lock()
            .expect("session state mutex poisoned") = SessionState::Stopped;
    }
}

async fn run_session(
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    inner: Arc<Inner>,
    events_rx: &mut mpsc::UnboundedReceiver<RebalanceEvent>,
    closed: CancellationToken,
) {
    let mut upstream_txs: HashMap<(String, i32), mpsc::UnboundedSender<OwnedMessage>> =
        HashMap::new();
    let mut is_trying_reconnect = false;
    let mut stream = consumer.stream();

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            event = events_rx.recv() => {
                match event {
                    None => break,
                    Some(RebalanceEvent::Assigned(parts)) => {
                        *inner.state.lock().expect("session state mutex poisoned") = SessionState::Running;
                        let mut partitions = inner.partitions.write().expect("partition map poisoned");
                        for (topic, partition) in parts {
                            let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
                            let (request_tx, request_rx) = mpsc::unbounded_channel();
                            upstream_txs.insert((topic.clone(), partition), upstream_tx);
                            partitions.insert((topic.clone(), partition), PartitionHandle { request_tx });
                            tokio::spawn(run_partition_dispatcher(
                                topic,
                                partition,
                                request_rx,
                                upstream_rx,
                                Arc::clone(&consumer),
                            ));
                        }
                        if is_trying_reconnect {
                            log::info!("consumer group rejoined, partitions reassigned");
                            is_trying_reconnect = false;
                        }
                    }
                    Some(RebalanceEvent::Revoked(parts)) => {
                        *inner.state.lock().expect("session state mutex poisoned") = SessionState::Reconnecting;
                        let mut partitions = inner.partitions.write().expect("partition map poisoned");
                        for key in &parts {
                            upstream_txs.remove(key);
                            partitions.remove(key);
                        }
                    }
                }
            }
            message = stream.next() => {
                match message {
                    None => {
                        if !is_trying_reconnect {
                            log::warn!("consumer stream ended, reconnecting");
                            is_trying_reconnect = true;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Some(Err(e)) => {
                        if !is_trying_reconnect {
                            log::warn!("consumer stream error, reconnecting: {e}");
                            is_trying_reconnect = true;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Some(Ok(borrowed)) => {
                        let owned = borrowed.detach();
                        let key = (owned.topic().to_string(), owned.partition());
                        match upstream_txs.get(&key) {
                            Some(tx) => { let _ = tx.send(owned); }
                            None => log::debug!("dropping message for unassigned partition {key:?}"),
                        }
                    }
                }
            }
        }
    }
}

async fn run_partition_dispatcher(
    topic: String,
    partition: i32,
    mut request_rx: mpsc::UnboundedReceiver<PendingRequest>,
    mut upstream_rx: mpsc::UnboundedReceiver<OwnedMessage>,
    consumer: Arc<StreamConsumer<RebalanceContext>>,
) {
    loop {
        let Some(req) = request_rx.recv().await else {
            break;
        };
        tokio::select! {
            biased;
            () = req.cancelled.cancelled() => continue,
            message = upstream_rx.recv() => {
                let Some(message) = message else { break };
                // Only the dispatcher that successfully `take()`s the shared
                // sender ever calls `send` — a oneshot can't buffer a value
                // past a receiver that's already gone the way a cloned mpsc
                // sender could, so at most one partition ever commits this
                // logical request.
                let taken = req
                    .response
                    .lock()
                    .expect("pending request mutex poisoned")
                    .take();
                match taken {
                    Some(tx) => {
                        if tx.send(message.clone()).is_ok() {
                            let mut tpl = TopicPartitionList::new();
                            if let Err(e) = tpl.add_partition_offset(
                                &topic,
                                partition,
                                KafkaOffset::Offset(message.offset() + 1),
                            ) {
                                log::warn!(
                                    "building commit offset for {topic}:{partition} failed: {e}"
                                );
                            } else if let Err(e) = consumer.commit(&tpl, CommitMode::Async) {
                                log::warn!("commit failed for {topic}:{partition}: {e}");
                            }
                        } else {
                            log::debug!("{topic}:{partition} discarding message, requester already gone");
                        }
                    }
                    None => {
                        log::debug!(
                            "{topic}:{partition} discarding message, another partition already answered this request"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_maps_to_auto_offset_reset() {
        assert_eq!(Offset::Earliest.as_auto_offset_reset(), "earliest");
        assert_eq!(Offset::Latest.as_auto_offset_reset(), "latest");
    }

    #[test]
    fn config_defaults_to_latest_offset() {
        let config = ConsumerConfig::new("localhost:9092", "topic-a,topic-b", "group-1");
        assert_eq!(config.offset, Offset::Latest);
        assert_eq!(config.topics, "topic-a,topic-b");
    }

    #[test]
    fn with_offset_overrides_default() {
        let config = ConsumerConfig::new("localhost:9092", "topic-a", "group-1")
            .with_offset(Offset::Earliest);
        assert_eq!(config.offset, Offset::Earliest);
    }
}
