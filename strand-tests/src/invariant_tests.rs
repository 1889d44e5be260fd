//! Cross-peer invariant checks.

use std::time::Duration;

use bytes::Bytes;

use strand_core::{LogConfig, LogIndex, MemberId, SessionId};
use strand_replica::RoleKind;
use strand_runtime::{ClientRequest, ClientResponse, ClientTransport};

use crate::harness::{fast_log_config, TestCluster};

/// Committed indices are contiguous and the committed prefix is
/// byte-for-byte identical on every peer.
#[tokio::test]
async fn test_gap_free_indices_and_agreement() {
    let mut cluster = TestCluster::start(3, fast_log_config()).await;
    cluster.elect(1);

    let session = cluster.session().await;
    let producer = session.producer();
    for i in 1..=30u32 {
        let index = producer.append(format!("value-{i}")).await.unwrap();
        assert_eq!(index, LogIndex::new(u64::from(i)), "indices strictly increase");
    }

    for member in [1, 2, 3] {
        cluster
            .wait_for_snapshot(member, Duration::from_secs(5), |s| {
                s.commit_index == LogIndex::new(30)
            })
            .await;
    }

    let reference = cluster.read_log(1).await;
    assert_eq!(reference.len(), 30);
    for (i, record) in reference.iter().enumerate() {
        assert_eq!(record.index, LogIndex::new(i as u64 + 1), "no gaps");
    }
    for member in [2, 3] {
        assert_eq!(
            cluster.read_log(member).await,
            reference,
            "member-{member} disagrees with primary"
        );
    }
}

/// The commit index never regresses across a failover.
#[tokio::test]
async fn test_commit_monotonic_across_failover() {
    let mut cluster = TestCluster::start(3, fast_log_config()).await;
    cluster.elect(1);

    let session = cluster.session().await;
    let producer = session.producer();
    for i in 1..=10u32 {
        producer.append(format!("first-{i}")).await.unwrap();
    }
    cluster
        .wait_for_snapshot(3, Duration::from_secs(5), |s| {
            s.commit_index == LogIndex::new(10)
        })
        .await;
    let before = cluster.snapshot(3).await.commit_index;

    cluster.elect(2);
    cluster
        .wait_for_snapshot(2, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    let session = cluster.session().await;
    let producer = session.producer();
    for i in 1..=5u32 {
        producer.append(format!("second-{i}")).await.unwrap();
    }

    for member in [1, 2, 3] {
        cluster
            .wait_for_snapshot(member, Duration::from_secs(5), |s| {
                s.commit_index == LogIndex::new(15)
            })
            .await;
        let after = cluster.snapshot(member).await.commit_index;
        assert!(after >= before, "commit regressed on member-{member}");
    }
}

/// Retrying a write with the same (session, seq) yields the same index
/// and a single copy in the log.
#[tokio::test]
async fn test_idempotent_producer_retry() {
    let mut cluster = TestCluster::start(3, fast_log_config()).await;
    cluster.elect(1);
    cluster
        .wait_for_snapshot(1, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    let (client, _events) = cluster.raw_client();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let index = loop {
        match cluster.wire_write(&client, 1, 300, 7, b"only-once").await {
            ClientResponse::Write { index } => break index,
            ClientResponse::Error(_) => {
                assert!(tokio::time::Instant::now() < deadline);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected response: {other:?}"),
        }
    };

    for _ in 0..3 {
        let repeat = cluster.wire_write(&client, 1, 300, 7, b"only-once").await;
        assert_eq!(repeat, ClientResponse::Write { index });
    }

    let log = cluster.read_log(1).await;
    let copies = log
        .iter()
        .filter(|r| r.value == Bytes::from_static(b"only-once"))
        .count();
    assert_eq!(copies, 1);
}

/// A restart reproduces the commit index and the full committed
/// prefix.
#[tokio::test]
async fn test_restart_round_trip() {
    let config = fast_log_config().with_replication_factor(1);
    let mut cluster = TestCluster::start(1, config).await;
    cluster.elect(1);

    let session = cluster.session().await;
    let producer = session.producer();
    for i in 1..=20u32 {
        producer.append(format!("durable-{i}")).await.unwrap();
    }
    cluster
        .wait_for_snapshot(1, Duration::from_secs(5), |s| {
            s.commit_index == LogIndex::new(20)
        })
        .await;
    let before = cluster.read_log(1).await;
    drop(session);

    cluster.shutdown(1).await;
    cluster.restart(1).await.unwrap();
    cluster
        .wait_for_snapshot(1, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    let snapshot = cluster.snapshot(1).await;
    assert_eq!(snapshot.last_index, LogIndex::new(20));
    assert_eq!(snapshot.commit_index, LogIndex::new(20));
    assert_eq!(cluster.read_log(1).await, before);

    // The log keeps growing from where it left off.
    let session = cluster.session().await;
    let index = session.producer().append("after-restart").await.unwrap();
    assert_eq!(index, LogIndex::new(21));
}

/// Sessions without heartbeats expire; the expired session is fatal.
#[tokio::test]
async fn test_session_expiry() {
    let config = LogConfig {
        session_timeout: Duration::from_millis(300),
        expire_interval: Duration::from_millis(100),
        ..fast_log_config().with_replication_factor(1)
    };
    let mut cluster = TestCluster::start(1, config).await;
    cluster.elect(1);
    cluster
        .wait_for_snapshot(1, Duration::from_secs(5), |s| s.role == RoleKind::Primary)
        .await;

    let (client, _events) = cluster.raw_client();
    let open = client
        .request(
            MemberId::new(1),
            ClientRequest::OpenSession {
                session_id: SessionId::new(400),
            },
        )
        .await
        .unwrap();
    assert_eq!(open, ClientResponse::OpenAck);

    // Silence past the timeout: the sweeper expires the session.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let heartbeat = client
        .request(
            MemberId::new(1),
            ClientRequest::Heartbeat {
                session_id: SessionId::new(400),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        heartbeat,
        ClientResponse::Error(strand_core::ErrorKind::SessionExpired)
    );
}
