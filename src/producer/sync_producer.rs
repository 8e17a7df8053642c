use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::{BrokerClient, DeliveryResult, ProducerMessage};
use crate::producer::delivery::deliver;
use crate::producer::payload::{Payload, encode};
use crate::producer::{CloseReport, Dispatch, Producer, ProducerConfig, ProducerMode};
use crate::utils::Error;

/// Sends one message at a time and waits for its acknowledgement.
pub struct SyncProducer {
    client: Arc<dyn BrokerClient>,
    topic: String,
    config: ProducerConfig,
    closed: AtomicBool,
    // held while closing so concurrent closers release the client once
    client_open: Mutex<bool>,
}

impl SyncProducer {
    pub fn new(client: Arc<dyn BrokerClient>, topic: impl Into<String>, config: ProducerConfig) -> Self {
        Self {
            client,
            topic: topic.into(),
            config,
            closed: AtomicBool::new(false),
            client_open: Mutex::new(true),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Send `payload` to the producer's topic and wait for the broker.
    pub async fn send<P: Payload + ?Sized>(&self, payload: &P) -> DeliveryResult {
        self.send_to(&self.topic, payload).await
    }

    pub async fn send_to<P: Payload + ?Sized>(&self, topic: &str, payload: &P) -> DeliveryResult {
        self.ensure_open()?;
        let message = encode(topic, payload)?;
        self.send_message(&message).await
    }

    /// Send an already encoded message.
    pub async fn send_message(&self, message: &ProducerMessage) -> DeliveryResult {
        self.ensure_open()?;
        deliver(self.client.as_ref(), message, &self.config).await
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed("producer"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Producer for SyncProducer {
    fn mode(&self) -> ProducerMode {
        ProducerMode::Sync
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, message: ProducerMessage) -> Result<Dispatch, Error> {
        self.send_message(&message).await.map(Dispatch::Delivered)
    }

    async fn close(&self) -> Result<CloseReport, Error> {
        self.closed.store(true, Ordering::SeqCst);

        let mut client_open = self.client_open.lock().await;
        if !*client_open {
            return Ok(CloseReport::default());
        }
        *client_open = false;

        if let Err(e) = self.client.close().await {
            warn!(error = %e, "failed to shut down the broker client cleanly");
            return Err(e.into());
        }
        info!(topic = %self.topic, "producer closed");
        Ok(CloseReport::default())
    }
}
