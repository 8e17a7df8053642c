use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{BrokerClient, ConsumedMessage, PartitionCursor, PartitionId};
use crate::consumer::{ConsumerConfig, PartitionError};
use crate::utils::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartitionExit {
    /// Cancelled, or nobody is listening any more.
    Stopped,
    Failed,
}

/// Reads one partition into the fan-in queue.
pub(crate) struct PartitionTask {
    pub client: Arc<dyn BrokerClient>,
    pub topic: String,
    pub partition: PartitionId,
    pub config: ConsumerConfig,
    pub queue: mpsc::Sender<ConsumedMessage>,
    pub errors: mpsc::Sender<PartitionError>,
    pub cancel: CancellationToken,
}

impl PartitionTask {
    pub async fn run(self) -> PartitionExit {
        let mut cursor = match self.open().await {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return PartitionExit::Stopped,
            Err(e) => return self.fail(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PartitionExit::Stopped,
                next = cursor.next() => next,
            };

            match next {
                Ok(message) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return PartitionExit::Stopped,
                        sent = self.queue.send(message) => {
                            if sent.is_err() {
                                return PartitionExit::Stopped;
                            }
                        }
                    }
                }
                Err(BrokerError::Closed) if self.cancel.is_cancelled() => {
                    return PartitionExit::Stopped;
                }
                Err(e) if e.is_retriable() => {
                    warn!(topic = %self.topic, partition = self.partition, error = %e, "read failed, retrying");
                    if !self.backoff().await {
                        return PartitionExit::Stopped;
                    }
                }
                Err(e) => return self.fail(e),
            }
        }
    }

    /// `Ok(None)` when cancelled before the cursor opened.
    async fn open(&self) -> Result<Option<Box<dyn PartitionCursor>>, BrokerError> {
        loop {
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                opened = timeout(
                    self.config.request_timeout,
                    self.client.open_cursor(&self.topic, self.partition, self.config.start),
                ) => opened,
            };

            match opened.unwrap_or(Err(BrokerError::TimedOut(self.config.request_timeout))) {
                Ok(cursor) => {
                    debug!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = cursor.next_offset(),
                        "partition cursor ready"
                    );
                    return Ok(Some(cursor));
                }
                Err(e) if e.is_retriable() => {
                    warn!(topic = %self.topic, partition = self.partition, error = %e, "opening cursor failed, retrying");
                    if !self.backoff().await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for the retry backoff; false if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.retry_backoff) => true,
        }
    }

    fn fail(&self, error: BrokerError) -> PartitionExit {
        warn!(topic = %self.topic, partition = self.partition, error = %error, "partition stopped");
        let report = PartitionError {
            topic: self.topic.clone(),
            partition: self.partition,
            error,
        };
        if let Err(e) = self.errors.try_send(report) {
            let report = match e {
                TrySendError::Full(r) | TrySendError::Closed(r) => r,
            };
            error!(error = %report, "partition failure not delivered; error channel unavailable");
        }
        PartitionExit::Failed
    }
}
