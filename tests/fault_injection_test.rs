mod common;

use std::sync::Arc;
use std::time::Duration;

use clusterdb::{
    ColumnId, ColumnValue, CorrelationId, EnvKeyProvider, Error, LogRecord, LogTransport,
    MessageEnvelope, OriginSeq, PacketCipher, RecordId, RecordWrite, ReplicaId, TableId,
    TransactionId, TransactionPacket, UserId,
};
use common::{
    eventually, publish_resolved, publish_unresolved, sequencer_of, test_config, FlakyLog,
    TestCluster, RESOLVED, UNRESOLVED,
};

const T: TableId = TableId::new(1);

fn simple_packet(replica: &clusterdb::Replica) -> (CorrelationId, TransactionPacket) {
    let c = replica.next_correlation_id();
    (
        c,
        TransactionPacket::new(
            UserId::new(1),
            vec![RecordWrite::create(T, c).with_value(ColumnId::new(1), ColumnValue::Bool(true))],
        ),
    )
}

#[tokio::test]
async fn test_malformed_submissions_do_not_consume_ids() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    let envelope = MessageEnvelope::unresolved(ReplicaId::new("intruder"), OriginSeq::from_raw(1));
    let key = envelope.encode().unwrap();

    // Garbage key, garbage payload, payload sealed under another secret.
    cluster
        .log
        .publish(UNRESOLVED, LogRecord { key: vec![0xff, 0x00], value: Some(vec![1, 2, 3]) })
        .await
        .unwrap();
    cluster
        .log
        .publish(UNRESOLVED, LogRecord { key: key.clone(), value: Some(b"not a packet".to_vec()) })
        .await
        .unwrap();
    let foreign = PacketCipher::new(EnvKeyProvider::from_key([9u8; 32]));
    let (_, packet) = simple_packet(&a);
    let sealed = foreign
        .seal(&clusterdb::codec::encode_packet(&packet).unwrap(), &envelope)
        .unwrap();
    cluster
        .log
        .publish(UNRESOLVED, LogRecord { key, value: Some(sealed) })
        .await
        .unwrap();

    let (c, packet) = simple_packet(&a);
    let ids = a.submit(packet).await.unwrap().await.unwrap();
    assert_eq!(a.last_applied().await.unwrap(), TransactionId::from_raw(1));

    let record = a.read_record(T, ids[&c]).await.unwrap().unwrap();
    assert_eq!(record.transaction_id, TransactionId::from_raw(1));

    // Only the valid submission reached the resolved log.
    assert_eq!(cluster.log.records(RESOLVED).len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_storage_failure_rejects_without_consuming_id() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let b = cluster.replica("b").clone();

    let doomed = TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::update(T, RecordId::new(999)).with_value(ColumnId::new(1), ColumnValue::Int(1))],
    );
    let err = b.submit(doomed).await.unwrap().await.unwrap_err();
    assert!(matches!(err, Error::TransactionRejected { .. }));

    let markers: Vec<_> = cluster
        .log
        .records(RESOLVED)
        .into_iter()
        .filter(|r| r.value.is_none())
        .collect();
    assert_eq!(markers.len(), 1);
    let marker_key = MessageEnvelope::decode(&markers[0].key).unwrap();
    assert_eq!(marker_key.origin, ReplicaId::new("b"));
    assert!(marker_key.is_resolved());

    let (c, packet) = simple_packet(&b);
    let ids = b.submit(packet).await.unwrap().await.unwrap();
    cluster.settle(TransactionId::from_raw(1)).await;
    let record = cluster.replica("a").read_record(T, ids[&c]).await.unwrap().unwrap();
    assert_eq!(record.transaction_id, TransactionId::from_raw(1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unresolved_correlation_rejected_up_front() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    let dangling = TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::update_pending(T, CorrelationId::new(44))],
    );
    let err = a.submit(dangling).await.unwrap_err();
    assert!(matches!(err, Error::UnresolvedCorrelation { .. }));
    assert_eq!(a.pending_operations(), 0);
    assert!(cluster.log.records(UNRESOLVED).is_empty());

    let mut numbered = simple_packet(&a).1;
    numbered.transaction_id = TransactionId::from_raw(3);
    assert!(matches!(a.submit(numbered).await, Err(Error::MalformedPacket(_))));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_gap_halts_applier_without_mutation() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    let mut ahead = TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::create_with_id(T, RecordId::new(1), CorrelationId::new(1))],
    );
    ahead.transaction_id = TransactionId::from_raw(5);
    publish_resolved(&cluster.log, "rogue", 1, &ahead).await;

    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        a.progress().halted.then_some(())
    })
    .await;

    assert_eq!(a.last_applied().await.unwrap(), TransactionId::NONE);
    assert!(a.read_record(T, RecordId::new(1)).await.unwrap().is_none());
    assert!(matches!(
        a.wait_for_transaction(TransactionId::from_raw(1)).await,
        Err(Error::Shutdown(_))
    ));

    // A halted replica gives up leadership and refuses new work.
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (!a.role().is_leader()).then_some(())
    })
    .await;
    assert!(matches!(a.submit(simple_packet(&a).1).await, Err(Error::Shutdown(_))));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_halt_fails_outstanding_submissions() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    // Keep the submission pending: nobody is sequencing.
    cluster.locks.disconnect(&sequencer_of("a")).unwrap();
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (!a.role().is_leader()).then_some(())
    })
    .await;
    let handle = a.submit(simple_packet(&a).1).await.unwrap();

    let mut ahead = simple_packet(&a).1;
    ahead.transaction_id = TransactionId::from_raw(3);
    publish_resolved(&cluster.log, "rogue", 1, &ahead).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("handle fails once the applier halts");
    assert!(matches!(outcome, Err(Error::Shutdown(_))));
    assert_eq!(a.pending_operations(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_applier_waits_out_resolved_log_outage() {
    let flaky = Arc::new(FlakyLog::new());
    let mut cluster = TestCluster::with_transport(flaky.log.clone(), flaky.clone(), test_config);
    cluster.start_replicas(&["a"]).await;
    let a = cluster.replica("a").clone();

    // Four attempts per retry round, so this outlasts three rounds.
    flaky.fail_resolved_polls(12);
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (flaky.poll_failures_left() == 0).then_some(())
    })
    .await;
    assert!(!a.progress().halted);
    assert!(a.role().is_leader());

    let (c, packet) = simple_packet(&a);
    let ids = tokio::time::timeout(Duration::from_secs(5), a.submit(packet).await.unwrap())
        .await
        .expect("applied after the outage")
        .unwrap();
    assert!(ids.contains_key(&c));
    assert_eq!(a.last_applied().await.unwrap(), TransactionId::from_raw(1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sequencer_rejects_unresolvable_packets_with_markers() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    let dangling = TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::update_pending(T, CorrelationId::new(44))],
    );
    let twice = TransactionPacket::new(
        UserId::new(1),
        vec![
            RecordWrite::create(T, CorrelationId::new(5)),
            RecordWrite::create(T, CorrelationId::new(5)),
        ],
    );
    publish_unresolved(&cluster.log, "a", 1, &dangling).await;
    publish_unresolved(&cluster.log, "a", 2, &twice).await;

    let markers = eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        let markers: Vec<_> = cluster
            .log
            .records(RESOLVED)
            .into_iter()
            .filter(|r| r.value.is_none())
            .collect();
        (markers.len() == 2).then_some(markers)
    })
    .await;
    let seqs: Vec<u64> = markers
        .iter()
        .map(|m| MessageEnvelope::decode(&m.key).unwrap().origin_seq.as_raw())
        .collect();
    assert_eq!(seqs, vec![1, 2]);
    assert_eq!(cluster.log.records(RESOLVED).len(), 2);

    let (c, packet) = simple_packet(&a);
    let ids = a.submit(packet).await.unwrap().await.unwrap();
    let record = a.read_record(T, ids[&c]).await.unwrap().unwrap();
    assert_eq!(record.transaction_id, TransactionId::from_raw(1));

    cluster.shutdown().await;
}

fn slow_publish_config(name: &str) -> clusterdb::ClusterConfig {
    let mut config = test_config(name);
    config.retry = clusterdb::RetryPolicy {
        base_delay: Duration::from_millis(200),
        max_retries: 5,
        max_delay: Duration::from_secs(1),
    };
    config
}

#[tokio::test]
async fn test_cancelled_submit_leaves_no_pending_entry() {
    let log = Arc::new(clusterdb::InMemoryLog::new());
    let mut cluster = TestCluster::with_transport(log.clone(), log.clone(), slow_publish_config);
    cluster.start_replicas(&["a"]).await;
    let a = cluster.replica("a").clone();

    log.fail_next_publishes(10);
    let (_, packet) = simple_packet(&a);
    assert!(tokio::time::timeout(Duration::from_millis(50), a.submit(packet)).await.is_err());
    assert_eq!(a.pending_operations(), 0);

    log.fail_next_publishes(0);
    let (c, packet) = simple_packet(&a);
    let ids = a.submit(packet).await.unwrap().await.unwrap();
    assert!(ids.contains_key(&c));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_deliveries_complete_once() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let b = cluster.replica("b").clone();

    let (c, packet) = simple_packet(&b);
    let ids = b.submit(packet).await.unwrap().await.unwrap();
    cluster.settle(TransactionId::from_raw(1)).await;

    // Redeliver both the submission and its resolution.
    let submission = cluster.log.records(UNRESOLVED).remove(0);
    let resolution = cluster.log.records(RESOLVED).remove(0);
    cluster.log.publish(UNRESOLVED, submission).await.unwrap();
    cluster.log.publish(RESOLVED, resolution).await.unwrap();

    for replica in &cluster.replicas {
        eventually(Duration::from_secs(5), Duration::from_millis(5), || {
            (replica.progress().replays == 1).then_some(())
        })
        .await;
    }

    // The duplicate submission was not sequenced again.
    let (c2, packet) = simple_packet(&b);
    let next = b.submit(packet).await.unwrap().await.unwrap();
    cluster.settle(TransactionId::from_raw(2)).await;
    let record = b.read_record(T, next[&c2]).await.unwrap().unwrap();
    assert_eq!(record.transaction_id, TransactionId::from_raw(2));

    let first = b.read_record(T, ids[&c]).await.unwrap().unwrap();
    assert_eq!(first.transaction_id, TransactionId::from_raw(1));
    assert_eq!(b.pending_operations(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_transient_publish_failures_are_retried() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    cluster.log.fail_next_publishes(2);
    let (c, packet) = simple_packet(&a);
    let ids = a.submit(packet).await.unwrap().await.unwrap();
    assert!(ids.contains_key(&c));

    cluster.log.fail_next_publishes(10);
    let (_, packet) = simple_packet(&a);
    assert!(matches!(a.submit(packet).await, Err(Error::Transport(_))));
    assert_eq!(a.pending_operations(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_outstanding_handles() {
    let cluster = TestCluster::start(&["a"]).await;
    let a = cluster.replica("a").clone();

    cluster.locks.disconnect(&common::sequencer_of("a")).unwrap();
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (!a.role().is_leader()).then_some(())
    })
    .await;

    let (_, packet) = simple_packet(&a);
    let handle = a.submit(packet).await.unwrap();
    a.shutdown().await;

    assert!(matches!(handle.await, Err(Error::Shutdown(_))));
    assert!(matches!(
        a.submit(simple_packet(&a).1).await,
        Err(Error::Shutdown(_))
    ));
}
