//! # partlog
//!
//! `partlog` produces records to, and consumes them from, a partitioned
//! append-only log such as Apache Kafka. It ships as a library and as the
//! interactive `partlog` command.
//!
//! ## Core Modules
//!
//! - `client`: the `BrokerClient` seam, with the embedded `MemoryBroker` and
//!   the optional Kafka client.
//! - `producer`: sync and async producers behind the `Producer` trait.
//! - `consumer`: per-partition tasks fanned into a single message handler.
//! - `config`: layered settings from file, environment and flags.
//! - `persistence`: the `sled` partition log behind the embedded broker.
//! - `cli`: argument parsing and the interactive sessions.
//! - `utils`: error types and logging.

pub mod cli;
pub mod client;
pub mod config;
pub mod consumer;
pub mod persistence;
pub mod producer;
pub mod utils;

#[cfg(test)]
mod tests;
