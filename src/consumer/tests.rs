use super::*;
use crate::client::{
    AckLevel, MemoryBroker, Offset, PartitionCursor, ProducerMessage, SendOptions,
};
use crate::config::LocalSettings;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::sleep;

fn broker() -> MemoryBroker {
    MemoryBroker::temporary(LocalSettings::default()).expect("temporary broker")
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        retry_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(2),
        ..ConsumerConfig::default()
    }
}

type Seen = Arc<Mutex<Vec<ConsumedMessage>>>;

fn collector() -> (Seen, impl FnMut(ConsumedMessage) + Send + 'static) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    let handler = move |message: ConsumedMessage| {
        if let Ok(mut seen) = sink.lock() {
            seen.push(message);
        }
    };
    (seen, handler)
}

fn count(seen: &Seen) -> usize {
    seen.lock().map(|s| s.len()).unwrap_or(0)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_all_retained_messages_are_delivered_once_in_partition_order() {
    let broker = broker();
    broker.create_topic("t", 3).expect("create");
    for i in 0..5 {
        broker.append("t", 0, format!("p0-{i}")).expect("append");
    }
    for i in 0..3 {
        broker.append("t", 1, format!("p1-{i}")).expect("append");
    }

    let consumer = Consumer::new(Arc::new(broker.clone()), fast_config());
    let (seen, handler) = collector();
    let subscription = consumer.subscribe("t", handler).await.expect("subscribe");
    assert_eq!(subscription.partitions(), &[0, 1, 2]);

    let watched = seen.clone();
    wait_until(move || count(&watched) == 8).await;
    let report = subscription.shutdown().await.expect("shutdown");

    assert_eq!(report.delivered, 8);
    assert_eq!(report.partitions, 3);
    assert!(report.failed_partitions.is_empty());
    assert_eq!(broker.cursors_opened(), 3);

    let seen = seen.lock().expect("lock");
    let mut per_partition: HashMap<PartitionId, Vec<Offset>> = HashMap::new();
    for message in seen.iter() {
        per_partition
            .entry(message.partition)
            .or_default()
            .push(message.offset);
    }
    assert_eq!(per_partition.get(&0), Some(&vec![0, 1, 2, 3, 4]));
    assert_eq!(per_partition.get(&1), Some(&vec![0, 1, 2]));
    assert_eq!(per_partition.get(&2), None);
}

#[tokio::test]
async fn test_unknown_topic_is_topic_not_found() {
    let broker = MemoryBroker::temporary(LocalSettings {
        auto_create_topics: false,
        ..LocalSettings::default()
    })
    .expect("temporary broker");
    let consumer = Consumer::new(Arc::new(broker.clone()), fast_config());

    let result = consumer.subscribe("nope", |_message: ConsumedMessage| {}).await;
    assert!(matches!(result, Err(Error::TopicNotFound(ref t)) if t == "nope"));
    assert_eq!(broker.cursors_opened(), 0);
}

#[tokio::test]
async fn test_newest_start_skips_retained_messages() {
    let broker = broker();
    broker.create_topic("t", 1).expect("create");
    broker.append("t", 0, "old-1").expect("append");
    broker.append("t", 0, "old-2").expect("append");

    let config = ConsumerConfig {
        start: StartOffset::Newest,
        ..fast_config()
    };
    let consumer = Consumer::new(Arc::new(broker.clone()), config);
    let (seen, handler) = collector();
    let subscription = consumer.subscribe("t", handler).await.expect("subscribe");

    let watched = broker.clone();
    wait_until(move || watched.cursors_opened() == 1).await;
    broker.append("t", 0, "fresh").expect("append");

    let watched = seen.clone();
    wait_until(move || count(&watched) == 1).await;
    let report = subscription.shutdown().await.expect("shutdown");

    assert_eq!(report.delivered, 1);
    let seen = seen.lock().expect("lock");
    assert_eq!(seen[0].payload, b"fresh");
    assert_eq!(seen[0].offset, 2);
}

#[tokio::test]
async fn test_failed_partition_does_not_stop_the_others() {
    let broker = broker();
    broker.create_topic("t", 2).expect("create");
    let consumer = Consumer::new(Arc::new(broker.clone()), fast_config());
    let (seen, handler) = collector();
    let mut subscription = consumer.subscribe("t", handler).await.expect("subscribe");
    let mut errors = subscription.take_errors().expect("error channel");
    assert!(subscription.take_errors().is_none());

    let watched = broker.clone();
    wait_until(move || watched.cursors_opened() == 2).await;
    broker.fail_partition("t", 1);

    let failure = errors.recv().await.expect("partition failure");
    assert_eq!(failure.partition, 1);
    assert_eq!(failure.topic, "t");
    assert!(matches!(failure.error, BrokerError::Disconnected(_)));

    broker.append("t", 0, "still flowing").expect("append");
    let watched = seen.clone();
    wait_until(move || count(&watched) == 1).await;

    let report = subscription.shutdown().await.expect("shutdown");
    assert_eq!(report.failed_partitions, vec![1]);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_handler_is_not_called_after_shutdown() {
    let broker = broker();
    broker.create_topic("t", 2).expect("create");
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();

    let consumer = Consumer::new(Arc::new(broker.clone()), fast_config());
    let subscription = consumer
        .subscribe("t", move |_message: ConsumedMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe");
    let watched = broker.clone();
    wait_until(move || watched.cursors_opened() == 2).await;

    broker.append("t", 0, "before").expect("append");
    let watched = calls.clone();
    wait_until(move || watched.load(Ordering::SeqCst) == 1).await;

    let report = subscription.shutdown().await.expect("shutdown");
    assert_eq!(report.delivered, 1);

    broker.append("t", 0, "after").expect("append");
    broker.append("t", 1, "after").expect("append");
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_live_messages_reach_the_handler() {
    let broker = broker();
    let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());
    let consumer = Consumer::new(client.clone(), fast_config());
    let (seen, handler) = collector();
    let subscription = consumer
        .subscribe("golangmessages", handler)
        .await
        .expect("subscribe");

    for word in ["hello", "world"] {
        let message = ProducerMessage {
            topic: "golangmessages".into(),
            key: None,
            payload: word.as_bytes().to_vec(),
        };
        client.send(&message, AckLevel::Leader.into()).await.expect("send");
    }

    let watched = seen.clone();
    wait_until(move || count(&watched) == 2).await;
    subscription.shutdown().await.expect("shutdown");

    let payloads: Vec<_> = seen
        .lock()
        .expect("lock")
        .iter()
        .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
        .collect();
    assert_eq!(payloads, vec!["hello", "world"]);
}

#[tokio::test]
async fn test_dropping_the_subscription_cancels_it() {
    let broker = broker();
    let consumer = Consumer::new(Arc::new(broker.clone()), fast_config());
    let subscription = consumer
        .subscribe("t", |_message: ConsumedMessage| {})
        .await
        .expect("subscribe");
    let token = subscription.cancellation_token();
    assert!(!token.is_cancelled());

    drop(subscription);
    assert!(token.is_cancelled());
}

/// Two partitions: 0 produces a message every few milliseconds, reading 1
/// panics.
struct PanickingPartition;

struct TickingCursor {
    partition: PartitionId,
    next_offset: Offset,
}

#[async_trait]
impl PartitionCursor for TickingCursor {
    fn topic(&self) -> &str {
        "t"
    }

    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn next_offset(&self) -> Offset {
        self.next_offset
    }

    async fn next(&mut self) -> Result<ConsumedMessage, BrokerError> {
        if self.partition == 1 {
            panic!("cursor for partition 1 is broken");
        }
        sleep(Duration::from_millis(2)).await;
        let offset = self.next_offset;
        self.next_offset += 1;
        Ok(ConsumedMessage {
            topic: "t".into(),
            partition: self.partition,
            offset,
            key: None,
            payload: b"tick".to_vec(),
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl BrokerClient for PanickingPartition {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn partitions(&self, _topic: &str) -> Result<Vec<PartitionId>, BrokerError> {
        Ok(vec![0, 1])
    }

    async fn open_cursor(
        &self,
        _topic: &str,
        partition: PartitionId,
        _start: StartOffset,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        Ok(Box::new(TickingCursor {
            partition,
            next_offset: 0,
        }))
    }

    async fn send(
        &self,
        _message: &ProducerMessage,
        _options: SendOptions,
    ) -> Result<(PartitionId, Offset), BrokerError> {
        Err(BrokerError::Other("read only".into()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_the_handler_when_a_partition_task_panics() {
    let consumer = Consumer::new(Arc::new(PanickingPartition), fast_config());
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    let subscription = consumer
        .subscribe("t", move |_message: ConsumedMessage| {
            // slow enough that a call is usually in flight when shutdown starts
            std::thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .expect("subscribe");

    let watched = calls.clone();
    wait_until(move || watched.load(Ordering::SeqCst) >= 3).await;

    let outcome = subscription.shutdown().await;
    assert!(matches!(outcome, Err(Error::Task(_))), "{outcome:?}");

    let after_shutdown = calls.load(Ordering::SeqCst);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);
}
