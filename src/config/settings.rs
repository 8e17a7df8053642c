use serde::Deserialize;
use uuid::Uuid;

use crate::client::{AckLevel, Compression, StartOffset};
use crate::producer::{ClosePolicy, OverflowPolicy, ProducerMode};
use crate::utils::Error;

pub const DEFAULT_TOPIC: &str = "golangmessages";

/// Top-level configuration settings for the application.
#[derive(Debug, Clone)]
pub struct Settings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub client_id: String,
    pub log_level: String,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub local: LocalSettings,
}

/// Producer knobs as they appear in configuration sources. Durations are in
/// milliseconds; `ProducerConfig` holds the converted snapshot.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProducerSettings {
    pub mode: ProducerMode,
    pub acks: AckLevel,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub compression: Compression,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub on_close: ClosePolicy,
    pub request_timeout_ms: u64,
    pub error_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConsumerSettings {
    pub start: StartOffset,
    pub queue_capacity: usize,
    pub error_capacity: usize,
    pub retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

/// Settings of the embedded broker used for `memory` addresses.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LocalSettings {
    pub auto_create_topics: bool,
    pub default_partitions: u32,
    pub max_messages_per_partition: Option<usize>,
}

/// What the configuration sources provide before defaults are merged in.
/// `brokers` is a comma separated list, matching the `KAFKA_PEERS` format.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct PartialSettings {
    pub brokers: Option<String>,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub log_level: Option<String>,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
    pub local: LocalSettings,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            mode: ProducerMode::Sync,
            acks: AckLevel::All,
            retries: 10,
            retry_backoff_ms: 100,
            compression: Compression::None,
            flush_interval_ms: 500,
            batch_size: 100,
            buffer_capacity: 1024,
            overflow: OverflowPolicy::Block,
            on_close: ClosePolicy::Deliver,
            request_timeout_ms: 10_000,
            error_capacity: 256,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            start: StartOffset::Oldest,
            queue_capacity: 256,
            error_capacity: 64,
            retry_backoff_ms: 500,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            auto_create_topics: true,
            default_partitions: 1,
            max_messages_per_partition: None,
        }
    }
}

/// Provides default values for `Settings`.
///
/// There is no default broker list: it has to come from a configuration
/// source, `KAFKA_PEERS` or the command line.
impl Default for Settings {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topic: DEFAULT_TOPIC.to_string(),
            client_id: format!("partlog-{}", Uuid::new_v4().simple()),
            log_level: "info".to_string(),
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

/// Split a comma separated broker list, dropping empty entries.
pub fn split_brokers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Reject settings nothing downstream could work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.brokers.is_empty() {
            return Err(Error::Configuration(
                "no brokers available: pass --brokers, set brokers in the config file, or export KAFKA_PEERS".into(),
            ));
        }
        crate::client::BrokerEndpoint::parse(&self.brokers)?;

        if self.topic.trim().is_empty() {
            return Err(Error::Configuration("topic must not be empty".into()));
        }

        let p = &self.producer;
        let c = &self.consumer;
        let positive = [
            ("producer.batch_size", p.batch_size),
            ("producer.buffer_capacity", p.buffer_capacity),
            ("producer.error_capacity", p.error_capacity),
            ("producer.flush_interval_ms", p.flush_interval_ms as usize),
            ("producer.request_timeout_ms", p.request_timeout_ms as usize),
            ("consumer.queue_capacity", c.queue_capacity),
            ("consumer.error_capacity", c.error_capacity),
            ("consumer.request_timeout_ms", c.request_timeout_ms as usize),
            ("local.default_partitions", self.local.default_partitions as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Configuration(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}
