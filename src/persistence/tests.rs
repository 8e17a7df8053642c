use super::{PartitionLog, StoredRecord};
use tempfile::tempdir;

fn record(payload: &str) -> StoredRecord {
    StoredRecord::new(None, payload.as_bytes().to_vec())
}

#[test]
fn test_append_assigns_sequential_offsets_per_partition() {
    let log = PartitionLog::temporary(None).unwrap();
    log.create_topic("orders", 2).unwrap();

    assert_eq!(log.append("orders", 0, &record("a")).unwrap(), 0);
    assert_eq!(log.append("orders", 0, &record("b")).unwrap(), 1);
    assert_eq!(log.append("orders", 1, &record("c")).unwrap(), 0);
    assert_eq!(log.high_watermark("orders", 0).unwrap(), 2);
    assert_eq!(log.high_watermark("orders", 1).unwrap(), 1);
}

#[test]
fn test_read_from_returns_records_in_offset_order() {
    let log = PartitionLog::temporary(None).unwrap();
    log.create_topic("orders", 1).unwrap();
    for i in 0..5 {
        log.append("orders", 0, &record(&format!("msg{i}"))).unwrap();
    }

    let records = log.read_from("orders", 0, 2, 10).unwrap();
    let offsets: Vec<_> = records.iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![2, 3, 4]);
    assert_eq!(records[0].1.payload, b"msg2");

    let limited = log.read_from("orders", 0, 0, 2).unwrap();
    assert_eq!(limited.len(), 2);
}

#[test]
fn test_empty_partition_reads_nothing() {
    let log = PartitionLog::temporary(None).unwrap();
    assert!(log.read_from("nothing", 0, 0, 10).unwrap().is_empty());
    assert_eq!(log.earliest_offset("nothing", 0).unwrap(), 0);
    assert_eq!(log.high_watermark("nothing", 0).unwrap(), 0);
}

#[test]
fn test_retention_drops_oldest_but_keeps_offsets() {
    let log = PartitionLog::temporary(Some(3)).unwrap();
    for i in 0..5 {
        log.append("capped", 0, &record(&format!("msg{i}"))).unwrap();
    }

    assert_eq!(log.earliest_offset("capped", 0).unwrap(), 2);
    assert_eq!(log.high_watermark("capped", 0).unwrap(), 5);

    let payloads: Vec<_> = log
        .read_from("capped", 0, 0, 10)
        .unwrap()
        .into_iter()
        .map(|(_, r)| String::from_utf8(r.payload).unwrap())
        .collect();
    assert_eq!(payloads, vec!["msg2", "msg3", "msg4"]);
}

#[test]
fn test_create_topic_keeps_first_partition_count() {
    let log = PartitionLog::temporary(None).unwrap();
    assert_eq!(log.create_topic("t", 3).unwrap(), 3);
    assert_eq!(log.create_topic("t", 7).unwrap(), 3);
    assert_eq!(log.topic_partitions("t").unwrap(), Some(3));
    assert_eq!(log.topic_partitions("missing").unwrap(), None);
    assert_eq!(log.topics().unwrap(), vec!["t".to_string()]);
}

#[test]
fn test_log_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let log = PartitionLog::open(dir.path(), None).unwrap();
        log.create_topic("durable", 1).unwrap();
        log.append("durable", 0, &record("kept")).unwrap();
        log.flush().unwrap();
    }

    let log = PartitionLog::open(dir.path(), None).unwrap();
    assert_eq!(log.topic_partitions("durable").unwrap(), Some(1));
    let records = log.read_from("durable", 0, 0, 10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.payload, b"kept");
    assert_eq!(log.append("durable", 0, &record("next")).unwrap(), 1);
}

#[test]
fn test_stored_record_keeps_key() {
    let log = PartitionLog::temporary(None).unwrap();
    let keyed = StoredRecord::new(Some(b"user-1".to_vec()), b"{}".to_vec());
    log.append("keyed", 0, &keyed).unwrap();

    let (_, stored) = log.read_from("keyed", 0, 0, 1).unwrap().remove(0);
    assert_eq!(stored, keyed);
}
