//! The retry loop both producers share.

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::client::{BrokerClient, DeliveryReceipt, DeliveryResult, ProducerMessage};
use crate::producer::ProducerConfig;
use crate::utils::{BrokerError, DeliveryError};

/// Send `message` until it is acknowledged, a non-retriable error occurs, or
/// `config.retries` retries are used up.
pub(crate) async fn deliver(
    client: &dyn BrokerClient,
    message: &ProducerMessage,
    config: &ProducerConfig,
) -> DeliveryResult {
    deliver_after(client, message, config, 0).await
}

/// Continue delivering a message that already had `attempts_made` attempts.
pub(crate) async fn deliver_after(
    client: &dyn BrokerClient,
    message: &ProducerMessage,
    config: &ProducerConfig,
    attempts_made: u32,
) -> DeliveryResult {
    let mut attempts = attempts_made;
    loop {
        attempts += 1;
        match send_once(client, message, config).await {
            Ok(receipt) => {
                debug!(
                    topic = %receipt.topic,
                    partition = receipt.partition,
                    offset = receipt.offset,
                    attempt = attempts,
                    "message delivered"
                );
                return Ok(receipt);
            }
            Err(e) if e.is_retriable() && attempts <= config.retries => {
                warn!(topic = %message.topic, attempt = attempts, error = %e, "send failed, retrying");
                sleep(config.retry_backoff).await;
            }
            Err(e) => return Err(DeliveryError::new(&message.topic, attempts, e).into()),
        }
    }
}

pub(crate) async fn send_once(
    client: &dyn BrokerClient,
    message: &ProducerMessage,
    config: &ProducerConfig,
) -> Result<DeliveryReceipt, BrokerError> {
    let options = config.send_options();
    let (partition, offset) = timeout(options.timeout, client.send(message, options))
        .await
        .map_err(|_| BrokerError::TimedOut(options.timeout))??;
    Ok(DeliveryReceipt {
        topic: message.topic.clone(),
        partition,
        offset,
    })
}
