//! Apache Kafka client
//!
//! `KafkaBroker` maps the `BrokerClient` seam onto `rdkafka`:
//! - one `FutureProducer` per acknowledgement level and compression codec,
//!   created on first use and shared by every caller (librdkafka producers are thread-safe and batch
//!   internally);
//! - one `StreamConsumer` per cursor, manually assigned to a single partition
//!   with auto-commit disabled, so no consumer group coordination happens;
//! - metadata lookups on a dedicated `BaseConsumer`, run on the blocking pool.
//!
//! librdkafka retries internally as well; its `retries` setting is forced to
//! zero so the producer's own retry ceiling is the only one in effect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{
    AckLevel, BrokerClient, Compression, ConsumedMessage, Offset, PartitionCursor, PartitionId,
    ProducerMessage, SendOptions, StartOffset,
};
use crate::config::Settings;
use crate::utils::{BrokerError, Error};

pub struct KafkaBroker {
    base: ClientConfig,
    client_id: String,
    timeout: Duration,
    metadata: Arc<BaseConsumer>,
    producers: Mutex<HashMap<(AckLevel, Compression), FutureProducer>>,
    closed: AtomicBool,
}

impl KafkaBroker {
    pub fn connect(brokers: &[String], settings: &Settings) -> Result<Self, Error> {
        let mut base = ClientConfig::new();
        base.set("bootstrap.servers", brokers.join(","))
            .set("client.id", &settings.client_id);

        let metadata: BaseConsumer = base
            .clone()
            .set("group.id", format!("{}-metadata", settings.client_id))
            .create()
            .map_err(|e| {
                Error::Configuration(format!("failed to create Kafka client: {e}"))
            })?;

        info!(brokers = %brokers.join(","), client_id = %settings.client_id, "connected to Kafka");
        Ok(Self {
            base,
            client_id: settings.client_id.clone(),
            timeout: Duration::from_millis(settings.producer.request_timeout_ms),
            metadata: Arc::new(metadata),
            producers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn producer(&self, options: SendOptions) -> Result<FutureProducer, BrokerError> {
        let SendOptions {
            acks,
            compression,
            timeout,
        } = options;
        let mut producers = self
            .producers
            .lock()
            .map_err(|_| BrokerError::Other("producer registry poisoned".into()))?;
        if let Some(producer) = producers.get(&(acks, compression)) {
            return Ok(producer.clone());
        }

        let kafka_acks = match acks {
            AckLevel::None => "0",
            AckLevel::Leader => "1",
            AckLevel::All => "all",
        };
        let producer: FutureProducer = self
            .base
            .clone()
            .set("acks", kafka_acks)
            .set("retries", "0")
            .set("compression.type", compression.as_str())
            .set("message.timeout.ms", timeout.as_millis().max(1).to_string())
            .create()
            .map_err(|e| classify(e, "", timeout))?;
        debug!(%acks, compression = compression.as_str(), "created Kafka producer");
        producers.insert((acks, compression), producer.clone());
        Ok(producer)
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        self.ensure_open()?;
        let consumer = self.metadata.clone();
        let name = topic.to_string();
        let timeout = self.timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&name), Timeout::After(timeout))
        })
        .await
        .map_err(|e| BrokerError::Other(e.to_string()))?
        .map_err(|e| classify(e, topic, timeout))?;

        let Some(entry) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        };
        if entry.error().is_some() || entry.partitions().is_empty() {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        let mut ids: Vec<PartitionId> = entry.partitions().iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn open_cursor(
        &self,
        topic: &str,
        partition: PartitionId,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        self.ensure_open()?;
        let consumer: StreamConsumer = self
            .base
            .clone()
            .set("group.id", format!("{}-{}", self.client_id, Uuid::new_v4()))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| classify(e, topic, self.timeout))?;

        let offset = match start {
            StartOffset::Oldest => KafkaOffset::Beginning,
            StartOffset::Newest => KafkaOffset::End,
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, offset)
            .map_err(|e| classify(e, topic, self.timeout))?;
        consumer
            .assign(&assignment)
            .map_err(|e| classify(e, topic, self.timeout))?;

        debug!(topic, partition, ?start, "Kafka cursor assigned");
        Ok(Box::new(KafkaCursor {
            consumer,
            topic: topic.to_string(),
            partition,
            next_offset: -1,
            timeout: self.timeout,
        }))
    }

    async fn send(
        &self,
        message: &ProducerMessage,
        options: SendOptions,
    ) -> Result<(PartitionId, Offset), BrokerError> {
        self.ensure_open()?;
        let producer = self.producer(options)?;
        deliver(&producer, message, options.timeout).await
    }

    async fn send_batch(
        &self,
        messages: &[ProducerMessage],
        options: SendOptions,
    ) -> Vec<Result<(PartitionId, Offset), BrokerError>> {
        let producer = match self.ensure_open().and_then(|()| self.producer(options)) {
            Ok(producer) => producer,
            Err(BrokerError::Closed) => {
                return messages.iter().map(|_| Err(BrokerError::Closed)).collect();
            }
            Err(e) => {
                let reason = e.to_string();
                return messages
                    .iter()
                    .map(|_| Err(BrokerError::Other(reason.clone())))
                    .collect();
            }
        };

        // enqueue everything first so librdkafka can batch, then await in order
        let pending = messages
            .iter()
            .map(|message| deliver(&producer, message, options.timeout));
        futures::future::join_all(pending).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let producers: Vec<FutureProducer> = self
            .producers
            .lock()
            .map(|mut producers| producers.drain().map(|(_, p)| p).collect())
            .unwrap_or_default();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            for producer in producers {
                if let Err(e) = producer.flush(Timeout::After(timeout)) {
                    warn!(error = %e, "Kafka producer did not flush cleanly");
                }
            }
        })
        .await
        .map_err(|e| BrokerError::Other(e.to_string()))?;
        info!("Kafka client closed");
        Ok(())
    }
}

/// One record, bounded by `timeout` on both the librdkafka queue and the
/// delivery report.
async fn deliver(
    producer: &FutureProducer,
    message: &ProducerMessage,
    timeout: Duration,
) -> Result<(PartitionId, Offset), BrokerError> {
    let mut record: FutureRecord<'_, [u8], [u8]> =
        FutureRecord::to(&message.topic).payload(message.payload.as_slice());
    if let Some(key) = message.key.as_deref() {
        record = record.key(key);
    }

    let sent = tokio::time::timeout(timeout, producer.send(record, Timeout::After(timeout)));
    match sent.await {
        Ok(result) => result.map_err(|(e, _)| classify(e, &message.topic, timeout)),
        Err(_) => Err(BrokerError::TimedOut(timeout)),
    }
}

struct KafkaCursor {
    consumer: StreamConsumer,
    topic: String,
    partition: PartitionId,
    next_offset: Offset,
    timeout: Duration,
}

#[async_trait]
impl PartitionCursor for KafkaCursor {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn next_offset(&self) -> Offset {
        self.next_offset
    }

    async fn next(&mut self) -> Result<ConsumedMessage, BrokerError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| classify(e, &self.topic, self.timeout))?;

        let consumed = ConsumedMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now),
        };
        self.next_offset = consumed.offset + 1;
        Ok(consumed)
    }
}

fn classify(error: KafkaError, topic: &str, timeout: Duration) -> BrokerError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::LeaderNotAvailable | RDKafkaErrorCode::NotLeaderForPartition) => {
            BrokerError::LeaderNotAvailable {
                topic: topic.to_string(),
                partition: None,
            }
        }
        Some(RDKafkaErrorCode::MessageTimedOut | RDKafkaErrorCode::RequestTimedOut) => {
            BrokerError::TimedOut(timeout)
        }
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::UnknownTopic(topic.to_string())
        }
        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            BrokerError::Disconnected(error.to_string())
        }
        _ => BrokerError::Other(error.to_string()),
    }
}
