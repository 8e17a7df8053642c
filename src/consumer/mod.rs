//! The `consumer` module reads every partition of a topic and hands the
//! messages to one handler.
//!
//! `Consumer::subscribe` starts one task per partition. Each task owns a
//! cursor and forwards what it reads into a bounded fan-in queue; a single
//! dispatcher task drains the queue and calls the `MessageHandler`, so the
//! handler never runs concurrently with itself. Order is preserved within a
//! partition and undefined across partitions.
//!
//! A partition that fails for good stops alone and is reported on the
//! subscription's error channel. Offsets are not committed anywhere: each
//! subscribe starts again from `ConsumerConfig::start`.

mod partition;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{BrokerClient, ConsumedMessage, PartitionId, StartOffset};
use crate::config::ConsumerSettings;
use crate::consumer::partition::{PartitionExit, PartitionTask};
use crate::utils::{BrokerError, Error};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub start: StartOffset,
    /// Bound of the fan-in queue between partition tasks and the handler.
    pub queue_capacity: usize,
    pub error_capacity: usize,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
}

impl From<&ConsumerSettings> for ConsumerConfig {
    fn from(s: &ConsumerSettings) -> Self {
        Self {
            start: s.start,
            queue_capacity: s.queue_capacity.max(1),
            error_capacity: s.error_capacity.max(1),
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms.max(1)),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from(&ConsumerSettings::default())
    }
}

/// Receives consumed messages, one at a time.
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, message: ConsumedMessage);
}

impl<F> MessageHandler for F
where
    F: FnMut(ConsumedMessage) + Send + 'static,
{
    fn handle(&mut self, message: ConsumedMessage) {
        self(message)
    }
}

/// A partition task gave up.
#[derive(Debug, thiserror::Error)]
#[error("partition {partition} of topic '{topic}' stopped: {error}")]
pub struct PartitionError {
    pub topic: String,
    pub partition: PartitionId,
    #[source]
    pub error: BrokerError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionReport {
    /// Number of partitions the subscription covered.
    pub partitions: usize,
    pub failed_partitions: Vec<PartitionId>,
    /// Handler invocations.
    pub delivered: u64,
}

pub struct Consumer {
    client: Arc<dyn BrokerClient>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(client: Arc<dyn BrokerClient>, config: ConsumerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start reading every partition of `topic` into `handler`.
    ///
    /// Fails with `Error::TopicNotFound` if the broker does not know the
    /// topic. Returns once the tasks are spawned; cursors open in the
    /// background.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> Result<Subscription, Error> {
        let partitions = timeout(self.config.request_timeout, self.client.partitions(topic))
            .await
            .map_err(|_| BrokerError::TimedOut(self.config.request_timeout))?
            .map_err(|e| match e {
                BrokerError::UnknownTopic(_) => Error::TopicNotFound(topic.to_string()),
                other => other.into(),
            })?;

        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(self.config.error_capacity);

        let tasks = partitions
            .iter()
            .map(|&partition| {
                let task = PartitionTask {
                    client: self.client.clone(),
                    topic: topic.to_string(),
                    partition,
                    config: self.config.clone(),
                    queue: queue_tx.clone(),
                    errors: errors_tx.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();
        // the queue closes once every partition task is gone
        drop(queue_tx);

        let dispatcher = tokio::spawn(dispatch(queue_rx, handler, cancel.clone()));
        info!(topic, partitions = partitions.len(), start = ?self.config.start, "subscribed");

        Ok(Subscription {
            topic: topic.to_string(),
            partitions,
            cancel,
            tasks,
            dispatcher: Some(dispatcher),
            errors: Some(errors_rx),
        })
    }
}

async fn dispatch<H: MessageHandler>(
    mut queue: mpsc::Receiver<ConsumedMessage>,
    mut handler: H,
    cancel: CancellationToken,
) -> u64 {
    let mut delivered = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = queue.recv() => match received {
                Some(message) => {
                    handler.handle(message);
                    delivered += 1;
                }
                None => break,
            },
        }
    }
    debug!(delivered, "dispatcher stopped");
    delivered
}

/// A running subscription. Dropping it cancels its tasks without waiting
/// for them; `shutdown` waits.
pub struct Subscription {
    topic: String,
    partitions: Vec<PartitionId>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<PartitionExit>>,
    dispatcher: Option<JoinHandle<u64>>,
    errors: Option<mpsc::Receiver<PartitionError>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Partition failures, available once.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<PartitionError>> {
        self.errors.take()
    }

    /// Token that stops the subscription when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for them. The handler is not called again
    /// once this returns.
    pub async fn shutdown(mut self) -> Result<SubscriptionReport, Error> {
        self.cancel.cancel();

        let exits = join_all(self.tasks.drain(..)).await;
        // the dispatcher is awaited even if a partition task panicked, so the
        // handler has stopped by the time this returns
        let delivered = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher.await?,
            None => 0,
        };

        let mut failed_partitions = Vec::new();
        for (partition, exit) in self.partitions.iter().zip(exits) {
            if exit? == PartitionExit::Failed {
                failed_partitions.push(*partition);
            }
        }

        let report = SubscriptionReport {
            partitions: self.partitions.len(),
            failed_partitions,
            delivered,
        };
        info!(
            topic = %self.topic,
            delivered = report.delivered,
            failed = report.failed_partitions.len(),
            "subscription stopped"
        );
        Ok(report)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests;
