//! The `producer` module turns application records into broker messages.
//!
//! Two implementations share the `Producer` trait, and `ProducerConfig::mode`
//! picks one in `build`:
//!
//! - `SyncProducer` waits for every message's acknowledgement and returns its
//!   partition and offset (or the failure) to the caller.
//! - `AsyncProducer` queues messages in a bounded buffer that a background
//!   task flushes by size or interval; failures arrive on an error channel.
//!
//! Delivery is at-least-once. A send that timed out may still have been
//! written, and retrying it writes it again, so consumers can see duplicates.
//! Nothing here deduplicates or reorders across retries.

mod async_producer;
mod delivery;
pub mod payload;
mod sync_producer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::client::{
    AckLevel, BrokerClient, Compression, DeliveryReceipt, ProducerMessage, SendOptions,
};
use crate::config::ProducerSettings;
use crate::utils::Error;

pub use async_producer::AsyncProducer;
pub use payload::{Json, Payload, Record, Text, encode};
pub use sync_producer::SyncProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProducerMode {
    #[default]
    Sync,
    Async,
}

/// What `send_async` does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for room.
    #[default]
    Block,
    /// Fail with `Error::BufferFull`.
    Reject,
}

/// What `close` does with messages still buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClosePolicy {
    #[default]
    Deliver,
    Discard,
}

/// Immutable producer configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub mode: ProducerMode,
    pub acks: AckLevel,
    /// Retries after the first attempt for retriable failures.
    pub retries: u32,
    pub retry_backoff: Duration,
    pub compression: Compression,
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub on_close: ClosePolicy,
    pub request_timeout: Duration,
    pub error_capacity: usize,
}

impl From<&ProducerSettings> for ProducerConfig {
    fn from(s: &ProducerSettings) -> Self {
        Self {
            mode: s.mode,
            acks: s.acks,
            retries: s.retries,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            compression: s.compression,
            flush_interval: Duration::from_millis(s.flush_interval_ms.max(1)),
            batch_size: s.batch_size.max(1),
            buffer_capacity: s.buffer_capacity.max(1),
            overflow: s.overflow,
            on_close: s.on_close,
            request_timeout: Duration::from_millis(s.request_timeout_ms.max(1)),
            error_capacity: s.error_capacity.max(1),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::from(&ProducerSettings::default())
    }
}

impl ProducerConfig {
    /// What every send from this producer asks of the broker client.
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            acks: self.acks,
            compression: self.compression,
            timeout: self.request_timeout,
        }
    }
}

/// Outcome of handing a message to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Acknowledged by the broker (sync mode).
    Delivered(DeliveryReceipt),
    /// Buffered for the flush task (async mode).
    Enqueued,
}

/// A message the async producer gave up on.
#[derive(Debug)]
pub struct FailedDelivery {
    pub message: ProducerMessage,
    pub error: Error,
}

/// Totals of the flush task over the async producer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    pub delivered: u64,
    pub failed: u64,
    pub discarded: u64,
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn mode(&self) -> ProducerMode;

    /// Topic used when the caller does not name one.
    fn topic(&self) -> &str;

    fn is_closed(&self) -> bool;

    /// Hand over an encoded message.
    async fn dispatch(&self, message: ProducerMessage) -> Result<Dispatch, Error>;

    /// Drain, release the broker client, and reject later sends. Calling it
    /// again returns an empty report.
    async fn close(&self) -> Result<CloseReport, Error>;

    /// The asynchronous failure channel, if this producer has one. It can be
    /// taken once.
    fn take_errors(&self) -> Option<mpsc::Receiver<FailedDelivery>> {
        None
    }
}

#[async_trait]
pub trait ProducerExt: Producer {
    /// Encode `payload` for the default topic and dispatch it.
    async fn publish<P>(&self, payload: &P) -> Result<Dispatch, Error>
    where
        P: Payload + Sync + ?Sized,
    {
        if self.is_closed() {
            return Err(Error::Closed("producer"));
        }
        let message = encode(self.topic(), payload)?;
        self.dispatch(message).await
    }

    async fn publish_to<P>(&self, topic: &str, payload: &P) -> Result<Dispatch, Error>
    where
        P: Payload + Sync + ?Sized,
    {
        if self.is_closed() {
            return Err(Error::Closed("producer"));
        }
        let message = encode(topic, payload)?;
        self.dispatch(message).await
    }
}

impl<T: Producer + ?Sized> ProducerExt for T {}

/// Build the producer `config.mode` asks for. Async mode spawns its flush
/// task, so this must run inside a tokio runtime.
pub fn build(
    client: Arc<dyn BrokerClient>,
    topic: impl Into<String>,
    config: ProducerConfig,
) -> Box<dyn Producer> {
    match config.mode {
        ProducerMode::Sync => Box::new(SyncProducer::new(client, topic, config)),
        ProducerMode::Async => Box::new(AsyncProducer::new(client, topic, config)),
    }
}
