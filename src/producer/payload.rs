//! Application records and how they become message bytes.
//!
//! `Payload::encode` is the only place a record is serialized. It must be
//! deterministic: the same record always yields the same bytes. `encode`
//! turns a payload into a `ProducerMessage` exactly once; retries resend those
//! bytes instead of encoding again.

use serde::Serialize;

use crate::client::ProducerMessage;
use crate::utils::Error;

pub trait Payload {
    /// Routing key; messages with the same key land on the same partition.
    fn key(&self) -> Option<Vec<u8>> {
        None
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;
}

/// The typed record the interactive producer sends: JSON
/// `{"name":..,"message":..}`, keyed by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub name: String,
    pub message: String,
}

impl Record {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Payload for Record {
    fn key(&self) -> Option<Vec<u8>> {
        Some(self.name.as_bytes().to_vec())
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A raw text payload, sent as its UTF-8 bytes without a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl Payload for Text {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(self.0.as_bytes().to_vec())
    }
}

impl Payload for str {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        Ok(self.as_bytes().to_vec())
    }
}

/// Any serde record, JSON encoded, optionally keyed.
#[derive(Debug, Clone)]
pub struct Json<T> {
    pub value: T,
    pub key: Option<String>,
}

impl<T: Serialize> Json<T> {
    pub fn new(value: T) -> Self {
        Self { value, key: None }
    }

    pub fn keyed(key: impl Into<String>, value: T) -> Self {
        Self {
            value,
            key: Some(key.into()),
        }
    }
}

impl<T: Serialize> Payload for Json<T> {
    fn key(&self) -> Option<Vec<u8>> {
        self.key.as_ref().map(|k| k.as_bytes().to_vec())
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.value)
    }
}

/// Serialize `payload` for `topic`. Fails with `Error::Serialization`; the
/// broker is never involved.
pub fn encode<P: Payload + ?Sized>(topic: &str, payload: &P) -> Result<ProducerMessage, Error> {
    let bytes = payload.encode().map_err(|source| Error::Serialization {
        topic: topic.to_string(),
        source,
    })?;
    Ok(ProducerMessage {
        topic: topic.to_string(),
        key: payload.key(),
        payload: bytes,
    })
}
