//! The `error` module defines the error types used across `partlog`.
//!
//! `BrokerError` is what a broker client reports for a single call. `Error`
//! is what the producer, consumer and CLI surface to their callers; every
//! message-scoped variant names the topic it belongs to.

use std::time::Duration;

use crate::client::PartitionId;

/// Failure reported by a `BrokerClient` implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("leader not available for topic '{topic}'{}", partition_suffix(.partition))]
    LeaderNotAvailable {
        topic: String,
        partition: Option<PartitionId>,
    },

    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("broker client is closed")]
    Closed,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same request may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::LeaderNotAvailable { .. } | BrokerError::TimedOut(_)
        )
    }

    /// Partition the failure is attributed to, when the broker told us.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            BrokerError::LeaderNotAvailable { partition, .. } => *partition,
            _ => None,
        }
    }
}

impl From<sled::Error> for BrokerError {
    fn from(e: sled::Error) -> Self {
        BrokerError::Storage(e.to_string())
    }
}

/// A message that could not be delivered after the retry ceiling.
#[derive(Debug, thiserror::Error)]
#[error(
    "delivery to topic '{topic}'{} failed after {attempts} attempt(s): {source}",
    partition_suffix(.partition)
)]
pub struct DeliveryError {
    pub topic: String,
    pub partition: Option<PartitionId>,
    pub attempts: u32,
    #[source]
    pub source: BrokerError,
}

impl DeliveryError {
    pub fn new(topic: impl Into<String>, attempts: u32, source: BrokerError) -> Self {
        Self {
            topic: topic.into(),
            partition: source.partition(),
            attempts,
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to serialize record for topic '{topic}': {source}")]
    Serialization {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("producer buffer is full ({capacity} messages), rejected message for topic '{topic}'")]
    BufferFull { topic: String, capacity: usize },

    #[error("message for topic '{0}' was discarded at shutdown")]
    Discarded(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn partition_suffix(partition: &Option<PartitionId>) -> String {
    partition.map(|p| format!(" partition {p}")).unwrap_or_default()
}
