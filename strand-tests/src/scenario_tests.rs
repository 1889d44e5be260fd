//! End-to-end scenarios across a three-server cluster.

use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::time::timeout;

use strand_client::ConsumerEvent;
use strand_core::LogIndex;
use strand_replica::RoleKind;
use strand_runtime::ClientResponse;

use crate::harness::{fast_log_config, TestCluster};

/// A producer's record reaches a consumer subscribed from the start of
/// the log.
#[tokio::test]
async fn test_producer_consumer() {
    let mut cluster = TestCluster::start(3, fast_log_config()).await;
    cluster.elect(1);

    let consumer_session = cluster.session().await;
    let producer_session = cluster.session().await;

    let mut consumer = consumer_session.consume(LogIndex::new(1)).await.unwrap();
    producer_session
        .producer()
        .append("Hello world!")
        .await
        .unwrap();

    let record = timeout(Duration::from_secs(5), consumer.next_record())
        .await
        .expect("record within deadline")
        .expect("stream open");
    assert_eq!(record.value, Bytes::from("Hello world!"));
    assert!(record.index >= LogIndex::new(1));
}

/// Subscribing at an index in the middle of the log delivers exactly
/// that record first.
#[tokio::test]
async fn test_consume_from_index() {
    let mut cluster = TestCluster::start(3, fast_log_config()).await;
    cluster.elect(1);

    let producer_session = cluster.session().await;
    let producer = producer_session.producer();
    for i in 1..=10u32 {
        producer.append(i.to_string()).await.unwrap();
    }

    let consumer_session = cluster.session().await;
    let mut consumer = consumer_session.consume(LogIndex::new(10)).await.unwrap();

    let record = timeout(Duration::from_secs(5), consumer.next_record())
        .await
        .expect("record within deadline")
        .expect("stream open");
    assert_eq!(record.index, LogIndex::new(10));
    assert_eq!(record.value, Bytes::from("10"));
}

/// After size-based compaction a consumer subscribing below the floor
/// sees a skip notice, then records from the new floor.
#[tokio::test]
async fn test_consume_after_size_compaction() {
    let config = fast_log_config()
        .with_max_segment_bytes(8 * 1024)
        .with_max_log_bytes(1024);
    let mut cluster = TestCluster::start(3, config).await;
    cluster.elect(1);

    let producer_session = cluster.session().await;
    let producer = producer_session.producer();

    let mut payload = [0u8; 36];
    for _ in 0..2000 {
        rand::thread_rng().fill_bytes(&mut payload);
        producer.append(payload.to_vec()).await.unwrap();
        if cluster.snapshot(1).await.segments.len() > 2 {
            break;
        }
    }
    assert!(cluster.snapshot(1).await.segments.len() > 2);

    cluster.compact_all().await;
    let floor = cluster.snapshot(1).await.first_index;
    assert!(floor > LogIndex::new(1));

    let consumer_session = cluster.session().await;
    let mut consumer = consumer_session.consume(LogIndex::new(1)).await.unwrap();

    let first = timeout(Duration::from_secs(5), consumer.next())
        .await
        .expect("event within deadline")
        .expect("stream open");
    let ConsumerEvent::CompactedSkip { new_index } = first else {
        panic!("expected skip notice before records, got {first:?}");
    };
    assert!(new_index > LogIndex::new(1));

    let record = timeout(Duration::from_secs(5), consumer.next_record())
        .await
        .expect("record within deadline")
        .expect("stream open");
    assert_eq!(record.index, new_index);
}

/// After age-based compaction the consumer likewise skips forward.
#[tokio::test]
async fn test_consume_after_age_compaction() {
    let config = fast_log_config()
        .with_max_segment_bytes(8 * 1024)
        .with_max_log_age(Duration::from_millis(10));
    let mut cluster = TestCluster::start(3, config).await;
    cluster.elect(1);

    let producer_session = cluster.session().await;
    let producer = producer_session.producer();

    let mut payload = [0u8; 36];
    for _ in 0..2000 {
        rand::thread_rng().fill_bytes(&mut payload);
        producer.append(payload.to_vec()).await.unwrap();
        if cluster.snapshot(1).await.segments.len() > 1 {
            break;
        }
    }
    assert!(cluster.snapshot(1).await.segments.len() > 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    cluster.compact_all().await;
    assert!(cluster.snapshot(1).await.first_index > LogIndex::new(1));

    let consumer_session = cluster.session().await;
    let mut consumer = consumer_session.consume(LogIndex::new(1)).await.unwrap();

    let record = timeout(Duration::from_secs(5), consumer.next_record())
        .await
        .expect("record within deadline")
        .expect("stream open");
    assert!(record.index > LogIndex::new(1));
}

/// A write that dies with the old primary resolves to exactly one
/// index when retried under the same sequence number against the new
/// primary.
#[tokio::test]
async fn test_failover_write_is_idempotent() {
    let config = fast_log_config().with_commit_timeout(Duration::from_millis(500));
    let mut cluster = TestCluster::start(3, config).await;
    cluster.elect(1);

    let (client, _events) = cluster.raw_client();

    // Cut the primary off from its backups, then write: the quorum
    // cannot be reached and the write fails, leaving an uncommitted
    // record on the doomed primary only.
    cluster.wait_for_snapshot(1, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;
    cluster.partition_peers(1, 2);
    cluster.partition_peers(1, 3);

    let response = cluster.wire_write(&client, 1, 100, 42, b"exactly-once").await;
    assert!(
        matches!(response, ClientResponse::Error(_)),
        "write without quorum must fail, got {response:?}"
    );

    // The primary dies; a new term elects a backup.
    cluster.kill(1);
    cluster.elect(2);
    cluster
        .wait_for_snapshot(2, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    // Retry under the same (session, seq) against the new primary.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let index = loop {
        match cluster.wire_write(&client, 2, 100, 42, b"exactly-once").await {
            ClientResponse::Write { index } => break index,
            ClientResponse::Error(_) => {
                assert!(tokio::time::Instant::now() < deadline, "retry never accepted");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected response: {other:?}"),
        }
    };

    // A further retry is deduplicated to the same index.
    let repeat = cluster.wire_write(&client, 2, 100, 42, b"exactly-once").await;
    assert_eq!(repeat, ClientResponse::Write { index });

    // Exactly one copy exists on the surviving peers.
    cluster
        .wait_for_snapshot(3, Duration::from_secs(5), |s| s.commit_index >= index)
        .await;
    for member in [2, 3] {
        let log = cluster.read_log(member).await;
        let copies = log
            .iter()
            .filter(|r| r.value == Bytes::from_static(b"exactly-once"))
            .count();
        assert_eq!(copies, 1, "member-{member} holds {copies} copies");
    }
}

/// An old primary's uncommitted tail is truncated when it rejoins; no
/// committed record is lost.
#[tokio::test]
async fn test_divergent_tail_truncation() {
    let config = fast_log_config().with_commit_timeout(Duration::from_millis(500));
    let mut cluster = TestCluster::start(3, config).await;
    cluster.elect(1);

    let (client, _events) = cluster.raw_client();
    cluster
        .wait_for_snapshot(1, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    // Two committed records.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for (seq, value) in [(1, b"a" as &[u8]), (2, b"b")] {
        loop {
            match cluster.wire_write(&client, 1, 200, seq, value).await {
                ClientResponse::Write { .. } => break,
                ClientResponse::Error(_) => {
                    assert!(tokio::time::Instant::now() < deadline, "write never accepted");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => panic!("unexpected response: {other:?}"),
            }
        }
    }

    // Isolate the primary, then append a record that can never commit.
    cluster.partition_peers(1, 2);
    cluster.partition_peers(1, 3);
    let response = cluster.wire_write(&client, 1, 200, 3, b"c").await;
    assert!(matches!(response, ClientResponse::Error(_)));
    let stale = cluster.snapshot(1).await;
    assert_eq!(stale.last_index, LogIndex::new(3));
    assert_eq!(stale.commit_index, LogIndex::new(2));

    // New term, new primary, new committed record at the same index the
    // old primary used for its orphan.
    cluster.elect(2);
    cluster
        .wait_for_snapshot(2, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match cluster.wire_write(&client, 2, 201, 1, b"d").await {
            ClientResponse::Write { index } => {
                assert_eq!(index, LogIndex::new(3));
                break;
            }
            ClientResponse::Error(_) => {
                assert!(tokio::time::Instant::now() < deadline, "write never accepted");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    // The old primary rejoins: its orphan is truncated and replaced.
    cluster.heal_peers(1, 2);
    cluster.heal_peers(1, 3);
    cluster
        .wait_for_snapshot(1, Duration::from_secs(10), |s| {
            s.commit_index == LogIndex::new(3)
        })
        .await;

    let reference = cluster.read_log(2).await;
    let values: Vec<&[u8]> = reference.iter().map(|r| r.value.as_ref()).collect();
    assert_eq!(values, vec![b"a" as &[u8], b"b", b"d"]);
    for member in [1, 3] {
        assert_eq!(cluster.read_log(member).await, reference, "member-{member} diverges");
    }
}
