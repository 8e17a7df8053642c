//! Embedded broker
//!
//! `MemoryBroker` implements `BrokerClient` on top of a `PartitionLog`. It
//! behaves like a single-node cluster: topics have a fixed partition count,
//! keyed messages are routed by a stable hash of the key, keyless messages
//! are spread round-robin, and offsets are assigned per partition.
//!
//! Acknowledgement levels map onto storage: `all` flushes the log to disk
//! before acknowledging, `leader` and `none` acknowledge after the in-memory
//! write. On a temporary log nothing survives the process either way.
//! Records are stored uncompressed whatever `SendOptions::compression` says.
//!
//! Cursors wait on a per-partition `Notify` that every append and `close`
//! wakes, so an idle cursor costs nothing until data arrives.
//!
//! A few hooks let tests drive failure paths: `fail_next_sends`,
//! `fail_partition`, `pause_sends`. Counters (`send_calls`, `cursors_opened`)
//! expose how often the broker was actually contacted.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use crate::client::{
    AckLevel, BrokerClient, ConsumedMessage, Offset, PartitionCursor, PartitionId,
    ProducerMessage, SendOptions, StartOffset,
};
use crate::config::LocalSettings;
use crate::persistence::{PartitionLog, StoredRecord};
use crate::utils::BrokerError;

/// Records fetched from the log per cursor read.
const FETCH_BATCH: usize = 256;

#[derive(Debug, Default)]
struct PartitionState {
    appended: Notify,
    failed: AtomicBool,
}

#[derive(Debug)]
struct Inner {
    log: PartitionLog,
    settings: LocalSettings,
    partitions: Mutex<HashMap<(String, PartitionId), Arc<PartitionState>>>,
    round_robin: AtomicUsize,
    closed: AtomicBool,
    injected_send_failures: Mutex<VecDeque<BrokerError>>,
    sends_paused: watch::Sender<bool>,
    send_calls: AtomicU64,
    cursors_opened: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Open a broker whose log lives at `path` and survives restarts.
    pub fn open(path: impl AsRef<Path>, settings: LocalSettings) -> Result<Self, BrokerError> {
        info!(path = %path.as_ref().display(), "opening embedded broker");
        let log = PartitionLog::open(path, settings.max_messages_per_partition)?;
        Ok(Self::with_log(log, settings))
    }

    /// A broker that forgets everything when dropped.
    pub fn temporary(settings: LocalSettings) -> Result<Self, BrokerError> {
        let log = PartitionLog::temporary(settings.max_messages_per_partition)?;
        Ok(Self::with_log(log, settings))
    }

    fn with_log(log: PartitionLog, settings: LocalSettings) -> Self {
        let (sends_paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                log,
                settings,
                partitions: Mutex::new(HashMap::new()),
                round_robin: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                injected_send_failures: Mutex::new(VecDeque::new()),
                sends_paused,
                send_calls: AtomicU64::new(0),
                cursors_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Create `topic` with `partitions` partitions. An existing topic keeps
    /// its partition count, which is returned.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::Other(format!(
                "topic '{topic}' needs at least one partition"
            )));
        }
        self.inner.log.create_topic(topic, partitions)
    }

    /// Append directly to a partition, bypassing routing. Useful to prepare
    /// a topic's contents.
    pub fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Offset, BrokerError> {
        let count = self.topic_partitions(topic)?;
        if partition < 0 || partition as u32 >= count {
            return Err(BrokerError::Other(format!(
                "topic '{topic}' has no partition {partition}"
            )));
        }
        let record = StoredRecord::new(None, payload.into());
        let offset = self.inner.log.append(topic, partition, &record)?;
        self.inner.state(topic, partition).appended.notify_waiters();
        Ok(offset)
    }

    /// Everything retained in one partition, oldest first.
    pub fn messages(
        &self,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Vec<ConsumedMessage>, BrokerError> {
        let mut out = Vec::new();
        let mut from = 0;
        loop {
            let batch = self.inner.log.read_from(topic, partition, from, FETCH_BATCH)?;
            let Some((last, _)) = batch.last() else {
                return Ok(out);
            };
            from = last + 1;
            out.extend(
                batch
                    .into_iter()
                    .map(|(offset, record)| to_consumed(topic, partition, offset, record)),
            );
        }
    }

    /// Make the next `errors.len()` sends fail with these errors, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = BrokerError>) {
        if let Ok(mut queue) = self.inner.injected_send_failures.lock() {
            queue.extend(errors);
        }
    }

    /// Permanently break one partition: its cursors return
    /// `BrokerError::Disconnected` from then on.
    pub fn fail_partition(&self, topic: &str, partition: PartitionId) {
        let state = self.inner.state(topic, partition);
        state.failed.store(true, Ordering::SeqCst);
        state.appended.notify_waiters();
    }

    /// Hold every send until `resume_sends` is called.
    pub fn pause_sends(&self) {
        self.inner.sends_paused.send_replace(true);
    }

    pub fn resume_sends(&self) {
        self.inner.sends_paused.send_replace(false);
    }

    /// Number of send requests that reached the broker.
    pub fn send_calls(&self) -> u64 {
        self.inner.send_calls.load(Ordering::SeqCst)
    }

    pub fn cursors_opened(&self) -> u64 {
        self.inner.cursors_opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn topic_partitions(&self, topic: &str) -> Result<u32, BrokerError> {
        if let Some(count) = self.inner.log.topic_partitions(topic)? {
            return Ok(count);
        }
        if self.inner.settings.auto_create_topics {
            let count = self
                .inner
                .log
                .create_topic(topic, self.inner.settings.default_partitions.max(1))?;
            info!(topic, partitions = count, "auto-created topic");
            return Ok(count);
        }
        Err(BrokerError::UnknownTopic(topic.to_string()))
    }

    fn route(&self, message: &ProducerMessage, partitions: u32) -> PartitionId {
        let slot = match &message.key {
            Some(key) => fnv1a(key) as usize,
            None => self.inner.round_robin.fetch_add(1, Ordering::Relaxed),
        };
        (slot % partitions as usize) as PartitionId
    }
}

impl Inner {
    fn state(&self, topic: &str, partition: PartitionId) -> Arc<PartitionState> {
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .clone()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        self.inner.ensure_open()?;
        let count = self.topic_partitions(topic)?;
        Ok((0..count as PartitionId).collect())
    }

    async fn open_cursor(
        &self,
        topic: &str,
        partition: PartitionId,
        start: StartOffset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        self.inner.ensure_open()?;
        let count = self.topic_partitions(topic)?;
        if partition < 0 || partition as u32 >= count {
            return Err(BrokerError::UnknownTopic(format!("{topic}/{partition}")));
        }

        let next_offset = match start {
            StartOffset::Oldest => self.inner.log.earliest_offset(topic, partition)?,
            StartOffset::Newest => self.inner.log.high_watermark(topic, partition)?,
        };
        self.inner.cursors_opened.fetch_add(1, Ordering::SeqCst);
        debug!(topic, partition, next_offset, "cursor opened");

        Ok(Box::new(MemoryCursor {
            state: self.inner.state(topic, partition),
            inner: self.inner.clone(),
            topic: topic.to_string(),
            partition,
            next_offset,
            buffered: VecDeque::new(),
        }))
    }

    async fn send(
        &self,
        message: &ProducerMessage,
        options: SendOptions,
    ) -> Result<(PartitionId, Offset), BrokerError> {
        let acks = options.acks;
        self.inner.ensure_open()?;
        self.inner.send_calls.fetch_add(1, Ordering::SeqCst);

        let mut paused = self.inner.sends_paused.subscribe();
        let resumed = paused.wait_for(|paused| !*paused).await.map(|_| ());
        if resumed.is_err() {
            return Err(BrokerError::Closed);
        }
        self.inner.ensure_open()?;

        let injected = self
            .inner
            .injected_send_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(err) = injected {
            debug!(topic = %message.topic, error = %err, "injected send failure");
            return Err(err);
        }

        let partitions = self.topic_partitions(&message.topic)?;
        let partition = self.route(message, partitions);
        let record = StoredRecord::new(message.key.clone(), message.payload.clone());
        let offset = self.inner.log.append(&message.topic, partition, &record)?;

        if acks == AckLevel::All {
            let inner = self.inner.clone();
            tokio::task::spawn_blocking(move || inner.log.flush())
                .await
                .map_err(|e| BrokerError::Storage(e.to_string()))??;
        }

        self.inner
            .state(&message.topic, partition)
            .appended
            .notify_waiters();
        debug!(topic = %message.topic, partition, offset, %acks, "appended");
        Ok((partition, offset))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let states: Vec<_> = self
            .inner
            .partitions
            .lock()
            .map(|partitions| partitions.values().cloned().collect())
            .unwrap_or_default();
        for state in states {
            state.appended.notify_waiters();
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.log.flush())
            .await
            .map_err(|e| BrokerError::Storage(e.to_string()))??;
        info!("embedded broker closed");
        Ok(())
    }
}

struct MemoryCursor {
    inner: Arc<Inner>,
    state: Arc<PartitionState>,
    topic: String,
    partition: PartitionId,
    next_offset: Offset,
    buffered: VecDeque<ConsumedMessage>,
}

#[async_trait]
impl PartitionCursor for MemoryCursor {
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
        loop {
            if self.state.failed.load(Ordering::SeqCst) {
                return Err(BrokerError::Disconnected(format!(
                    "partition {}/{} is unavailable",
                    self.topic, self.partition
                )));
            }
            if let Some(message) = self.buffered.pop_front() {
                self.next_offset = message.offset + 1;
                return Ok(message);
            }

            // register for wakeups before reading so an append in between is not missed
            let appended = self.state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            self.inner.ensure_open()?;
            if self.state.failed.load(Ordering::SeqCst) {
                continue;
            }

            let batch = self
                .inner
                .log
                .read_from(&self.topic, self.partition, self.next_offset, FETCH_BATCH)?;
            if batch.is_empty() {
                appended.await;
                continue;
            }
            self.buffered.extend(
                batch
                    .into_iter()
                    .map(|(offset, record)| to_consumed(&self.topic, self.partition, offset, record)),
            );
        }
    }
}

fn to_consumed(
    topic: &str,
    partition: PartitionId,
    offset: Offset,
    record: StoredRecord,
) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: record.key,
        payload: record.payload,
        timestamp: DateTime::<Utc>::from_timestamp_millis(record.timestamp)
            .unwrap_or_else(Utc::now),
    }
}

/// 32-bit FNV-1a; stable across processes, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}
