use super::session::{SessionSummary, consume_until, produce_lines};
use super::*;
use crate::client::MemoryBroker;
use crate::config::LocalSettings;
use crate::producer::{ProducerConfig, SyncProducer};
use crate::utils::BrokerError;
use clap::CommandFactory;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

fn broker() -> MemoryBroker {
    MemoryBroker::temporary(LocalSettings::default()).expect("temporary broker")
}

/// Writer whose contents can be read back after it moved into a handler.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("poisoned"))?
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn test_flags_are_parsed() {
    let cli = Cli::try_parse_from([
        "partlog",
        "--brokers",
        "kafka1:9092,kafka2:9092",
        "--topic",
        "audit",
        "--mode",
        "consume",
        "--ack",
        "leader",
        "--async",
        "--format",
        "raw",
        "--from",
        "newest",
        "-v",
    ])
    .expect("valid arguments");

    assert_eq!(cli.brokers.as_deref(), Some("kafka1:9092,kafka2:9092"));
    assert_eq!(cli.mode, Mode::Consume);
    assert_eq!(cli.ack, Some(AckLevel::Leader));
    assert!(cli.async_send);
    assert_eq!(cli.format, Format::Raw);
    assert_eq!(cli.from, Some(StartOffset::Newest));
    assert!(cli.verbose);
}

#[test]
fn test_defaults_and_bad_values() {
    let cli = Cli::try_parse_from(["partlog"]).expect("no arguments");
    assert_eq!(cli.mode, Mode::Produce);
    assert_eq!(cli.format, Format::Json);
    assert!(cli.brokers.is_none());
    assert!(!cli.async_send);

    assert!(Cli::try_parse_from(["partlog", "--ack", "most"]).is_err());
    assert!(Cli::try_parse_from(["partlog", "--mode", "mirror"]).is_err());
}

#[test]
fn test_flags_override_loaded_settings() {
    let cli = Cli::try_parse_from([
        "partlog",
        "--brokers",
        " memory ",
        "--topic",
        "audit",
        "--ack",
        "none",
        "--async",
        "--from",
        "newest",
    ])
    .expect("valid arguments");

    let mut settings = Settings {
        brokers: vec!["from-file:9092".into()],
        ..Settings::default()
    };
    cli.apply(&mut settings);

    assert_eq!(settings.brokers, vec!["memory"]);
    assert_eq!(settings.topic, "audit");
    assert_eq!(settings.producer.acks, AckLevel::None);
    assert_eq!(settings.producer.mode, ProducerMode::Async);
    assert_eq!(settings.consumer.start, StartOffset::Newest);
    assert!(settings.validate().is_ok());
}

#[test]
fn test_missing_flags_keep_loaded_settings() {
    let cli = Cli::try_parse_from(["partlog"]).expect("no arguments");
    let mut settings = Settings {
        brokers: vec!["kafka1:9092".into()],
        ..Settings::default()
    };
    let before = settings.clone();
    cli.apply(&mut settings);

    assert_eq!(settings.brokers, before.brokers);
    assert_eq!(settings.topic, before.topic);
    assert_eq!(settings.producer, before.producer);
}

#[tokio::test]
async fn test_json_session_reports_partition_and_offset() {
    let broker = broker();
    let producer = SyncProducer::new(Arc::new(broker.clone()), "golangmessages", ProducerConfig::default());
    let input: &[u8] = b"a\nhello\nb\nworld\n\n";
    let mut output = Vec::new();

    let summary = produce_lines(&producer, Format::Json, input, &mut output)
        .await
        .expect("session");
    assert_eq!(summary, SessionSummary { sent: 2, failed: 0 });

    let text = String::from_utf8(output).expect("utf-8");
    assert!(text.contains("Enter Name: "));
    assert!(text.contains("Enter Message: "));
    assert!(text.contains("Message was saved to partition: 0. Message offset is: 0."));
    assert!(text.contains("Message was saved to partition: 0. Message offset is: 1."));

    let stored = broker.messages("golangmessages", 0).expect("read");
    assert_eq!(stored[0].payload, br#"{"name":"a","message":"hello"}"#);
    assert_eq!(stored[1].payload, br#"{"name":"b","message":"world"}"#);
}

#[tokio::test]
async fn test_raw_session_stops_at_end_of_input() {
    let broker = broker();
    let producer = SyncProducer::new(Arc::new(broker.clone()), "t", ProducerConfig::default());
    let input: &[u8] = b"first line\nsecond line";
    let mut output = Vec::new();

    let summary = produce_lines(&producer, Format::Raw, input, &mut output)
        .await
        .expect("session");
    assert_eq!(summary.sent, 2);
    assert_eq!(broker.messages("t", 0).expect("read")[1].payload, b"second line");
    assert!(String::from_utf8_lossy(&output).contains("Enter message: "));
}

#[tokio::test]
async fn test_failed_message_is_reported_and_the_loop_continues() {
    let broker = broker();
    broker.fail_next_sends([BrokerError::Other("record too large".into())]);
    let producer = SyncProducer::new(Arc::new(broker.clone()), "t", ProducerConfig::default());
    let input: &[u8] = b"one\ntwo\n";
    let mut output = Vec::new();

    let summary = produce_lines(&producer, Format::Raw, input, &mut output)
        .await
        .expect("session");
    assert_eq!(summary, SessionSummary { sent: 1, failed: 1 });

    let text = String::from_utf8(output).expect("utf-8");
    assert!(text.contains("Failed to store your data: "), "{text}");
    assert!(text.contains("record too large"), "{text}");
    assert!(text.contains("Message offset is: 0."), "{text}");
}

#[tokio::test]
async fn test_async_session_queues_messages() {
    let broker = broker();
    let config = ProducerConfig {
        mode: ProducerMode::Async,
        ..ProducerConfig::default()
    };
    let producer = producer::build(Arc::new(broker.clone()), "t", config);
    let input: &[u8] = b"queued\n";
    let mut output = Vec::new();

    produce_lines(producer.as_ref(), Format::Raw, input, &mut output)
        .await
        .expect("session");
    assert!(String::from_utf8_lossy(&output).contains("Message queued for delivery."));

    let report = producer.close().await.expect("close");
    assert_eq!(report.delivered, 1);
    assert_eq!(broker.messages("t", 0).expect("read").len(), 1);
}

#[tokio::test]
async fn test_consumer_session_prints_payloads_until_enter() {
    let broker = broker();
    broker.append("golangmessages", 0, "hello").expect("append");
    broker.append("golangmessages", 0, "world").expect("append");

    let consumer = Consumer::new(Arc::new(broker.clone()), ConsumerConfig::default());
    let (keyboard, mut typing) = tokio::io::duplex(16);
    let output = SharedBuf::default();
    let printed = output.clone();

    let session = tokio::spawn(async move {
        consume_until(
            &consumer,
            "golangmessages",
            BufReader::new(keyboard),
            output,
            std::future::pending(),
        )
        .await
    });

    for _ in 0..200 {
        if printed.text().contains("world") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    typing.write_all(b"\n").await.expect("press enter");

    let report = session.await.expect("task").expect("session");
    assert_eq!(report.delivered, 2);
    assert_eq!(printed.text(), "--Hit enter to quit--\nhello\nworld\n");
}
