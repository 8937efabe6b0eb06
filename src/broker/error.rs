//! Typed error kinds callers are expected to `match` on (§7), as opposed to
//! the `anyhow::Error` chains used for ambient setup failures elsewhere in
//! this module.

use thiserror::Error;

/// Errors [`super::consumer::Consumer::read_message`] can return.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// No message was delivered to this caller within its timeout.
    #[error("read_message timed out waiting for a message")]
    ReadMsgTimeout,

    /// `Close()` has already been called on this consumer.
    #[error("read_message called on a closed consumer")]
    ReadClosedConsumer,
}

/// Errors [`super::producer::Producer::send_message`] and
/// [`super::producer::Producer::send_explicit_message`] can return.
#[derive(Debug, Error)]
pub enum ProducerError {
    /// The underlying producer's outbound queue stayed full for the whole
    /// enqueue timeout.
    #[error("enqueue timed out waiting for producer queue capacity")]
    WriteTimeout,

    /// Enqueue failed for a reason other than a full queue (e.g. an
    /// unknown topic with topic auto-creation disabled).
    #[error("failed to enqueue message: {0}")]
    Enqueue(String),
}
