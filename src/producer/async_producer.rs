use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{BrokerClient, DeliveryReceipt, ProducerMessage};
use crate::producer::delivery::deliver_after;
use crate::producer::payload::{Payload, encode};
use crate::producer::{
    CloseReport, ClosePolicy, Dispatch, FailedDelivery, OverflowPolicy, Producer, ProducerConfig,
    ProducerMode,
};
use crate::utils::{DeliveryError, Error};

/// Buffers messages and lets a background task deliver them in batches.
///
/// A batch goes out when `batch_size` messages are waiting or when
/// `flush_interval` passes, whichever comes first. Messages that still fail
/// after their retries are reported on the channel returned by
/// `take_errors`; nobody waits for them otherwise.
pub struct AsyncProducer {
    client: Arc<dyn BrokerClient>,
    topic: String,
    config: ProducerConfig,
    tx: mpsc::Sender<ProducerMessage>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    flusher: tokio::sync::Mutex<Option<JoinHandle<CloseReport>>>,
    errors: Mutex<Option<mpsc::Receiver<FailedDelivery>>>,
}

impl AsyncProducer {
    /// Spawns the flush task; must be called inside a tokio runtime.
    pub fn new(client: Arc<dyn BrokerClient>, topic: impl Into<String>, config: ProducerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(config.error_capacity);
        let shutdown = CancellationToken::new();

        let flusher = Flusher {
            client: client.clone(),
            config: config.clone(),
            errors: errors_tx,
            report: CloseReport::default(),
        };
        let handle = tokio::spawn(flusher.run(rx, shutdown.clone()));

        Self {
            client,
            topic: topic.into(),
            config,
            tx,
            closed: AtomicBool::new(false),
            shutdown,
            flusher: tokio::sync::Mutex::new(Some(handle)),
            errors: Mutex::new(Some(errors_rx)),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Queue `payload` for the producer's topic. Returns once the message is
    /// buffered, not when it is delivered.
    pub async fn send_async<P: Payload + ?Sized>(&self, payload: &P) -> Result<(), Error> {
        self.send_async_to(&self.topic, payload).await
    }

    pub async fn send_async_to<P: Payload + ?Sized>(
        &self,
        topic: &str,
        payload: &P,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let message = encode(topic, payload)?;
        self.enqueue(message).await
    }

    async fn enqueue(&self, message: ProducerMessage) -> Result<(), Error> {
        self.ensure_open()?;
        match self.config.overflow {
            OverflowPolicy::Block => self
                .tx
                .send(message)
                .await
                .map_err(|_| Error::Closed("producer")),
            OverflowPolicy::Reject => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(message)) => {
                    warn!(
                        topic = %message.topic,
                        capacity = self.config.buffer_capacity,
                        "send buffer full, rejecting message"
                    );
                    Err(Error::BufferFull {
                        topic: message.topic,
                        capacity: self.config.buffer_capacity,
                    })
                }
                Err(TrySendError::Closed(_)) => Err(Error::Closed("producer")),
            },
        }
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
impl Producer for AsyncProducer {
    fn mode(&self) -> ProducerMode {
        ProducerMode::Async
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, message: ProducerMessage) -> Result<Dispatch, Error> {
        self.enqueue(message).await.map(|()| Dispatch::Enqueued)
    }

    async fn close(&self) -> Result<CloseReport, Error> {
        self.closed.store(true, Ordering::SeqCst);

        // a concurrent close waits here and then finds the handle gone
        let mut flusher = self.flusher.lock().await;
        let Some(handle) = flusher.take() else {
            return Ok(CloseReport::default());
        };

        self.shutdown.cancel();
        let report = handle.await?;
        self.client.close().await?;
        info!(
            topic = %self.topic,
            delivered = report.delivered,
            failed = report.failed,
            discarded = report.discarded,
            "producer closed"
        );
        Ok(report)
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<FailedDelivery>> {
        self.errors.lock().ok().and_then(|mut errors| errors.take())
    }
}

impl Drop for AsyncProducer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Flusher {
    client: Arc<dyn BrokerClient>,
    config: ProducerConfig,
    errors: mpsc::Sender<FailedDelivery>,
    report: CloseReport,
}

impl Flusher {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProducerMessage>,
        shutdown: CancellationToken,
    ) -> CloseReport {
        let mut pending = Vec::with_capacity(self.config.batch_size);
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(message) => {
                        pending.push(message);
                        if pending.len() >= self.config.batch_size {
                            self.flush(std::mem::take(&mut pending)).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(std::mem::take(&mut pending)).await;
                    }
                }
            }
        }

        // senders that already hold a permit still get their message in
        rx.close();
        while let Some(message) = rx.recv().await {
            pending.push(message);
        }

        match self.config.on_close {
            ClosePolicy::Deliver => {
                debug!(remaining = pending.len(), "delivering buffered messages before close");
                let mut remaining = pending.into_iter().peekable();
                while remaining.peek().is_some() {
                    let batch: Vec<_> = remaining.by_ref().take(self.config.batch_size).collect();
                    self.flush(batch).await;
                }
            }
            ClosePolicy::Discard => {
                if !pending.is_empty() {
                    warn!(count = pending.len(), "discarding buffered messages on close");
                }
                for message in pending {
                    self.report.discarded += 1;
                    let error = Error::Discarded(message.topic.clone());
                    self.report_failure(FailedDelivery { message, error });
                }
            }
        }
        self.report
    }

    /// `request_timeout` applies to each send inside the client, so a batch
    /// of healthy sends may take longer than one timeout in total.
    async fn flush(&mut self, batch: Vec<ProducerMessage>) {
        let results = self
            .client
            .send_batch(&batch, self.config.send_options())
            .await;
        debug!(size = batch.len(), "flushed batch");

        for (message, result) in batch.into_iter().zip(results) {
            let outcome = match result {
                Ok((partition, offset)) => Ok(DeliveryReceipt {
                    topic: message.topic.clone(),
                    partition,
                    offset,
                }),
                Err(e) if e.is_retriable() && self.config.retries > 0 => {
                    warn!(topic = %message.topic, error = %e, "batched send failed, retrying");
                    sleep(self.config.retry_backoff).await;
                    deliver_after(self.client.as_ref(), &message, &self.config, 1).await
                }
                Err(e) => Err(DeliveryError::new(&message.topic, 1, e).into()),
            };

            match outcome {
                Ok(_) => self.report.delivered += 1,
                Err(error) => {
                    self.report.failed += 1;
                    self.report_failure(FailedDelivery { message, error });
                }
            }
        }
    }

    fn report_failure(&self, failure: FailedDelivery) {
        if let Err(e) = self.errors.try_send(failure) {
            let failure = match e {
                TrySendError::Full(f) | TrySendError::Closed(f) => f,
            };
            error!(
                topic = %failure.message.topic,
                error = %failure.error,
                "message lost; error channel unavailable"
            );
        }
    }
}
