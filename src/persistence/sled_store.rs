//! Partitioned log backed by `sled`
//!
//! Every `(topic, partition)` pair gets its own sled tree named
//! `"{topic}/{partition}"`. Keys are big-endian offsets, so iteration yields
//! records in offset order and the last key is the high watermark minus one.
//! Partition counts live in the `__topics` tree.
//!
//! Retention: with `max_messages_per_partition` set, the oldest records of a
//! partition are removed after each append once the limit is exceeded. The
//! offsets of surviving records never change.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::client::{Offset, PartitionId};
use crate::utils::BrokerError;

const TOPICS_TREE: &str = "__topics";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Milliseconds since the UNIX epoch, set at append time.
    pub timestamp: i64,
}

impl StoredRecord {
    pub fn new(key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            key,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

pub struct PartitionLog {
    db: Db,
    max_messages_per_partition: Option<usize>,
    // offset assignment is read-last-then-insert, so appends are serialized
    append_lock: Mutex<()>,
}

impl PartitionLog {
    /// Open or create a log at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        max_messages_per_partition: Option<usize>,
    ) -> Result<Self, BrokerError> {
        let db = sled::open(path)?;
        Ok(Self::with_db(db, max_messages_per_partition))
    }

    /// A log that lives only as long as this process.
    pub fn temporary(max_messages_per_partition: Option<usize>) -> Result<Self, BrokerError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::with_db(db, max_messages_per_partition))
    }

    fn with_db(db: Db, max_messages_per_partition: Option<usize>) -> Self {
        Self {
            db,
            max_messages_per_partition: max_messages_per_partition.filter(|max| *max > 0),
            append_lock: Mutex::new(()),
        }
    }

    /// Register a topic. Returns the partition count now on record, which is
    /// the existing one if the topic was already known.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<u32, BrokerError> {
        if let Some(existing) = self.topic_partitions(topic)? {
            return Ok(existing);
        }
        let topics = self.db.open_tree(TOPICS_TREE)?;
        topics.insert(topic.as_bytes(), partitions.to_be_bytes().to_vec())?;
        Ok(partitions)
    }

    pub fn topic_partitions(&self, topic: &str) -> Result<Option<u32>, BrokerError> {
        let topics = self.db.open_tree(TOPICS_TREE)?;
        match topics.get(topic.as_bytes())? {
            Some(raw) => {
                let bytes: [u8; 4] = raw[..].try_into().map_err(|_| {
                    BrokerError::Storage(format!("corrupt partition count for topic '{topic}'"))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn topics(&self) -> Result<Vec<String>, BrokerError> {
        let topics = self.db.open_tree(TOPICS_TREE)?;
        topics
            .iter()
            .keys()
            .map(|key| -> Result<String, BrokerError> {
                let key = key?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }

    /// Append a record and return the offset it was stored at.
    pub fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        record: &StoredRecord,
    ) -> Result<Offset, BrokerError> {
        let serialized =
            serde_json::to_vec(record).map_err(|e| BrokerError::Storage(e.to_string()))?;
        let tree = self.partition_tree(topic, partition)?;

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| BrokerError::Storage("append lock poisoned".into()))?;

        let offset = next_offset_of(&tree)?;
        tree.insert(offset_key(offset), serialized)?;

        if let Some(max) = self.max_messages_per_partition {
            let keep_from = offset + 1 - max as Offset;
            while let Some((key, _)) = tree.first()? {
                if decode_offset(&key)? >= keep_from {
                    break;
                }
                tree.remove(key)?;
            }
        }

        Ok(offset)
    }

    /// Up to `max` records starting at `from` (inclusive), in offset order.
    pub fn read_from(
        &self,
        topic: &str,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> Result<Vec<(Offset, StoredRecord)>, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        let start = offset_key(from.max(0));

        tree.range(start..)
            .take(max)
            .map(|entry| -> Result<(Offset, StoredRecord), BrokerError> {
                let (key, value) = entry?;
                let record: StoredRecord = serde_json::from_slice(&value)
                    .map_err(|e| BrokerError::Storage(e.to_string()))?;
                Ok((decode_offset(&key)?, record))
            })
            .collect()
    }

    /// Offset of the oldest retained record, or the high watermark when the
    /// partition is empty.
    pub fn earliest_offset(&self, topic: &str, partition: PartitionId) -> Result<Offset, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        match tree.first()? {
            Some((key, _)) => decode_offset(&key),
            None => next_offset_of(&tree),
        }
    }

    /// Offset the next appended record will get.
    pub fn high_watermark(&self, topic: &str, partition: PartitionId) -> Result<Offset, BrokerError> {
        let tree = self.partition_tree(topic, partition)?;
        next_offset_of(&tree)
    }

    /// Block until every write so far is on disk.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush()?;
        Ok(())
    }

    fn partition_tree(&self, topic: &str, partition: PartitionId) -> Result<Tree, BrokerError> {
        Ok(self.db.open_tree(format!("{topic}/{partition}"))?)
    }
}

impl std::fmt::Debug for PartitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLog")
            .field("db", &"sled::Db")
            .field("max_messages_per_partition", &self.max_messages_per_partition)
            .finish()
    }
}

fn offset_key(offset: Offset) -> [u8; 8] {
    (offset as u64).to_be_bytes()
}

fn decode_offset(key: &[u8]) -> Result<Offset, BrokerError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| BrokerError::Storage(format!("corrupt offset key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes) as Offset)
}

fn next_offset_of(tree: &Tree) -> Result<Offset, BrokerError> {
    match tree.last()? {
        Some((key, _)) => Ok(decode_offset(&key)? + 1),
        None => Ok(0),
    }
}
