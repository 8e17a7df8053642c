//! The `client` module is the seam between `partlog` and a broker.
//!
//! `BrokerClient` is everything the producer and consumer need from a
//! partitioned log: partition discovery, per-partition read cursors, and
//! sends with an acknowledgement level. Two implementations exist:
//!
//! - `MemoryBroker`: an embedded log on `sled`, used by tests and by the
//!   `memory` / `memory://<dir>` broker addresses.
//! - `KafkaBroker` (feature `kafka`): Apache Kafka through `rdkafka`.
//!
//! Connection sharing: a single `Arc<dyn BrokerClient>` is shared by the
//! producer's flush task and every partition task, so implementations must be
//! safe for concurrent use. `KafkaBroker` gives each cursor its own consumer
//! connection and shares the producers.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::Settings;
use crate::utils::{BrokerError, Error};

pub use memory::MemoryBroker;

pub type PartitionId = i32;
pub type Offset = i64;

/// How much confirmation a send waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    /// Fire and forget (at-most-once).
    None,
    /// The partition leader wrote it locally.
    #[serde(alias = "local")]
    Leader,
    /// Every in-sync replica has it.
    #[default]
    All,
}

impl AckLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckLevel::None => "none",
            AckLevel::Leader => "leader",
            AckLevel::All => "all",
        }
    }
}

impl FromStr for AckLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "0" => Ok(AckLevel::None),
            "leader" | "local" | "1" => Ok(AckLevel::Leader),
            "all" | "-1" => Ok(AckLevel::All),
            other => Err(format!(
                "unknown ack level '{other}' (expected none, leader or all)"
            )),
        }
    }
}

impl fmt::Display for AckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Per-request delivery options, taken from the producer's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub acks: AckLevel,
    pub compression: Compression,
    /// Bound on a single send, including waiting for the acknowledgement.
    pub timeout: Duration,
}

impl SendOptions {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(acks: AckLevel) -> Self {
        Self {
            acks,
            compression: Compression::None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

impl From<AckLevel> for SendOptions {
    fn from(acks: AckLevel) -> Self {
        Self::new(acks)
    }
}

/// Where a new cursor starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// The oldest retained message.
    #[default]
    Oldest,
    /// Only messages appended after the cursor was opened.
    Newest,
}

impl FromStr for StartOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "oldest" | "earliest" | "beginning" => Ok(StartOffset::Oldest),
            "newest" | "latest" | "end" => Ok(StartOffset::Newest),
            other => Err(format!(
                "unknown start offset '{other}' (expected oldest or newest)"
            )),
        }
    }
}

/// A message ready to send. The payload is encoded once when the message is
/// built and reused by every retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Where the broker stored a message. `(topic, partition, offset)` uniquely
/// identifies it in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
}

pub type DeliveryResult = Result<DeliveryReceipt, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Read position on one partition of a topic.
#[async_trait]
pub trait PartitionCursor: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> PartitionId;

    /// Offset of the next message this cursor will yield.
    fn next_offset(&self) -> Offset;

    /// Wait for the next message. Offsets returned by one cursor strictly
    /// increase.
    async fn next(&mut self) -> Result<ConsumedMessage, BrokerError>;
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Partition ids of `topic`. Fails with `BrokerError::UnknownTopic` when
    /// the topic does not exist and will not be auto-created.
    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError>;

    async fn open_cursor(
        &self,
        topic: &str,
        partition: PartitionId,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError>;

    /// Send one message and return the partition and offset it was stored at.
    async fn send(
        &self,
        message: &ProducerMessage,
        options: SendOptions,
    ) -> Result<(PartitionId, Offset), BrokerError>;

    /// Send several messages; results are in input order. `options.timeout`
    /// bounds each send on its own, never the batch as a whole.
    async fn send_batch(
        &self,
        messages: &[ProducerMessage],
        options: SendOptions,
    ) -> Vec<Result<(PartitionId, Offset), BrokerError>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let sent = tokio::time::timeout(options.timeout, self.send(message, options))
                .await
                .unwrap_or(Err(BrokerError::TimedOut(options.timeout)));
            results.push(sent);
        }
        results
    }

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A parsed `brokers` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// Embedded log; `None` keeps it in memory only.
    Memory(Option<String>),
    /// `host:port` bootstrap servers.
    Kafka(Vec<String>),
}

impl BrokerEndpoint {
    pub fn parse(brokers: &[String]) -> Result<Self, Error> {
        let brokers: Vec<&str> = brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect();

        let Some(first) = brokers.first() else {
            return Err(Error::Configuration("no brokers configured".into()));
        };

        if *first == "memory" || first.starts_with("memory://") {
            if brokers.len() > 1 {
                return Err(Error::Configuration(
                    "an embedded 'memory' broker cannot be combined with other brokers".into(),
                ));
            }
            let path = first
                .strip_prefix("memory://")
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            return Ok(BrokerEndpoint::Memory(path));
        }

        for broker in &brokers {
            let valid = broker
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(Error::Configuration(format!(
                    "invalid broker address '{broker}' (expected host:port)"
                )));
            }
        }
        Ok(BrokerEndpoint::Kafka(
            brokers.into_iter().map(str::to_string).collect(),
        ))
    }
}

/// Build the broker client the settings describe.
pub fn connect(settings: &Settings) -> Result<Arc<dyn BrokerClient>, Error> {
    match BrokerEndpoint::parse(&settings.brokers)? {
        BrokerEndpoint::Memory(path) => {
            let broker = match path {
                Some(path) => MemoryBroker::open(path, settings.local.clone())?,
                None => MemoryBroker::temporary(settings.local.clone())?,
            };
            Ok(Arc::new(broker))
        }
        #[cfg(feature = "kafka")]
        BrokerEndpoint::Kafka(brokers) => {
            let broker = kafka::KafkaBroker::connect(&brokers, settings)?;
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "kafka"))]
        BrokerEndpoint::Kafka(brokers) => Err(Error::Configuration(format!(
            "cannot connect to {}: built without the 'kafka' feature (use --brokers memory or rebuild with --features kafka)",
            brokers.join(",")
        ))),
    }
}
