use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use crate::client::{self, AckLevel, BrokerClient, ConsumedMessage, MemoryBroker};
use crate::config::{LocalSettings, Settings};
use crate::consumer::{Consumer, ConsumerConfig};
use crate::producer::{
    self, AsyncProducer, Producer, ProducerConfig, ProducerExt, ProducerMode, Record, SyncProducer,
};

async fn collect(consumer: &Consumer, topic: &str, expected: usize) -> Vec<ConsumedMessage> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = consumer
        .subscribe(topic, move |message: ConsumedMessage| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(message);
            }
        })
        .await
        .expect("subscribe");

    for _ in 0..300 {
        if seen.lock().map(|s| s.len() >= expected).unwrap_or(false) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let report = subscription.shutdown().await.expect("shutdown");
    assert_eq!(report.delivered as usize, expected);

    seen.lock().expect("lock").clone()
}

#[tokio::test]
async fn all_acks_survive_a_broker_restart() {
    let dir = TempDir::new().expect("tempdir");
    let settings = LocalSettings::default();

    {
        let broker = MemoryBroker::open(dir.path(), settings.clone()).expect("open broker");
        let config = ProducerConfig {
            acks: AckLevel::All,
            ..ProducerConfig::default()
        };
        let producer = SyncProducer::new(Arc::new(broker), "golangmessages", config);
        let first = producer.send(&Record::new("a", "hello")).await.expect("send");
        let second = producer.send(&Record::new("b", "world")).await.expect("send");
        assert_eq!((first.offset, second.offset), (0, 1));
        producer.close().await.expect("close");
    }

    let reopened = MemoryBroker::open(dir.path(), settings).expect("reopen broker");
    let consumer = Consumer::new(Arc::new(reopened), ConsumerConfig::default());
    let messages = collect(&consumer, "golangmessages", 2).await;

    let payloads: Vec<_> = messages.iter().map(|m| m.payload.clone()).collect();
    assert_eq!(
        payloads,
        vec![
            br#"{"name":"a","message":"hello"}"#.to_vec(),
            br#"{"name":"b","message":"world"}"#.to_vec(),
        ]
    );
}

#[tokio::test]
async fn async_producer_output_is_consumed_in_key_order() {
    let broker = MemoryBroker::temporary(LocalSettings {
        default_partitions: 3,
        ..LocalSettings::default()
    })
    .expect("temporary broker");
    let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());

    let config = ProducerConfig {
        mode: ProducerMode::Async,
        batch_size: 4,
        flush_interval: Duration::from_millis(20),
        ..ProducerConfig::default()
    };
    let producer = AsyncProducer::new(client.clone(), "chat", config);
    for i in 0..10 {
        let name = if i % 2 == 0 { "alice" } else { "bob" };
        producer
            .send_async(&Record::new(name, format!("{i}")))
            .await
            .expect("enqueue");
    }

    // consume before closing: close releases the shared client
    let consumer = Consumer::new(client.clone(), ConsumerConfig::default());
    let messages = collect(&consumer, "chat", 10).await;
    let report = producer.close().await.expect("close");
    assert_eq!(report.delivered, 10);

    for name in ["alice", "bob"] {
        let key = name.as_bytes().to_vec();
        let ours: Vec<_> = messages
            .iter()
            .filter(|m| m.key.as_ref() == Some(&key))
            .collect();
        assert_eq!(ours.len(), 5);
        assert!(ours.windows(2).all(|w| w[0].partition == w[1].partition));
        assert!(ours.windows(2).all(|w| w[0].offset < w[1].offset));
    }
}

#[tokio::test]
async fn settings_drive_the_whole_pipeline() {
    let dir = TempDir::new().expect("tempdir");
    let mut settings = Settings {
        brokers: vec![format!("memory://{}", dir.path().display())],
        topic: "pipeline".into(),
        ..Settings::default()
    };
    settings.producer.acks = AckLevel::Leader;
    settings.validate().expect("valid settings");

    let client = client::connect(&settings).expect("connect");
    let producer = producer::build(
        client.clone(),
        &settings.topic,
        ProducerConfig::from(&settings.producer),
    );
    assert_eq!(producer.mode(), ProducerMode::Sync);
    producer.publish("one").await.expect("publish");
    producer.publish("two").await.expect("publish");

    let consumer = Consumer::new(client, ConsumerConfig::from(&settings.consumer));
    let messages = collect(&consumer, &settings.topic, 2).await;
    assert_eq!(messages[1].payload, b"two");
    producer.close().await.expect("close");
}
