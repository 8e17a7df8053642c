//! The `persistence` module stores partitioned logs for the embedded broker.
//!
//! Records are kept per `(topic, partition)` in offset order so a cursor can
//! replay from the oldest retained offset. Storage is `sled`, either on disk
//! (survives a restart) or temporary.

pub mod sled_store;

pub use sled_store::{PartitionLog, StoredRecord};

#[cfg(test)]
mod tests;
