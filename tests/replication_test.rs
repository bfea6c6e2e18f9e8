mod common;

use std::collections::BTreeSet;

use clusterdb::{
    ColumnId, ColumnValue, CorrelationId, MultiReferenceEdit, RecordId, RecordRef, RecordWrite,
    TableId, TransactionId, TransactionPacket, UserId,
};
use common::TestCluster;

const ORDERS: TableId = TableId::new(1);
const LINES: TableId = TableId::new(2);

fn order(replica: &clusterdb::Replica, label: &str) -> (CorrelationId, TransactionPacket) {
    let c = replica.next_correlation_id();
    let packet = TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::create(ORDERS, c).with_value(ColumnId::new(1), ColumnValue::Text(label.to_string()))],
    );
    (c, packet)
}

#[tokio::test]
async fn test_every_replica_applies_the_same_total_order() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;

    let mut tasks = Vec::new();
    for (n, replica) in cluster.replicas.iter().enumerate() {
        let replica = replica.clone();
        tasks.push(tokio::spawn(async move {
            let mut created = Vec::new();
            for i in 0..10 {
                let (c, packet) = order(&replica, &format!("{}-{}", n, i));
                let ids = replica.submit(packet).await.unwrap().await.unwrap();
                created.push(ids[&c]);
            }
            created
        }));
    }

    let mut all_ids = BTreeSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(all_ids.insert(id), "record id {} assigned twice", id);
        }
    }
    assert_eq!(all_ids.len(), 30);

    cluster.settle(TransactionId::from_raw(30)).await;

    for id in 1..=30u32 {
        let reference = cluster.replicas[0]
            .read_record(ORDERS, RecordId::new(id))
            .await
            .unwrap()
            .expect("record exists on a");
        for replica in &cluster.replicas[1..] {
            let record = replica.read_record(ORDERS, RecordId::new(id)).await.unwrap().unwrap();
            assert_eq!(record, reference, "record {} differs on {}", id, replica.replica_id());
        }
    }

    // One create per transaction, so ids and transactions line up.
    let txns: BTreeSet<u64> = {
        let mut txns = BTreeSet::new();
        for id in 1..=30u32 {
            let rec = cluster.replicas[1].read_record(ORDERS, RecordId::new(id)).await.unwrap().unwrap();
            txns.insert(rec.transaction_id.as_raw());
        }
        txns
    };
    assert_eq!(txns, (1..=30).collect());

    for replica in &cluster.replicas {
        assert_eq!(replica.last_applied().await.unwrap(), TransactionId::from_raw(30));
        assert_eq!(replica.pending_operations(), 0);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_created_record_reaches_uninvolved_replica() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let a = cluster.replica("a").clone();
    let b = cluster.replica("b").clone();
    let filler = TableId::new(99);

    // Forty unrelated transactions, then one that moves ORDERS' sequence to 103.
    for _ in 0..40 {
        let c = a.next_correlation_id();
        a.submit(TransactionPacket::new(UserId::new(1), vec![RecordWrite::create(filler, c)]))
            .await
            .unwrap()
            .await
            .unwrap();
    }
    a.submit(TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::create_with_id(ORDERS, RecordId::new(102), CorrelationId::new(1))],
    ))
    .await
    .unwrap()
    .await
    .unwrap();

    let seven = CorrelationId::new(7);
    let ids = a
        .submit(TransactionPacket::new(
            UserId::new(5),
            vec![RecordWrite::create(ORDERS, seven).with_value(ColumnId::new(1), ColumnValue::Long(77))],
        ))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[&seven], RecordId::new(103));

    b.wait_for_transaction(TransactionId::from_raw(42)).await.unwrap();
    let record = b.read_record(ORDERS, RecordId::new(103)).await.unwrap().expect("replicated");
    assert_eq!(record.transaction_id, TransactionId::from_raw(42));
    assert_eq!(record.user_id, UserId::new(5));
    assert_eq!(record.values[&ColumnId::new(1)], ColumnValue::Long(77));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_references_resolve_to_created_ids_everywhere() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let b = cluster.replica("b").clone();

    let head = b.next_correlation_id();
    let first = b.next_correlation_id();
    let second = b.next_correlation_id();
    let packet = TransactionPacket::new(
        UserId::new(2),
        vec![
            RecordWrite::create(ORDERS, head),
            RecordWrite::create(LINES, first)
                .with_value(ColumnId::new(1), ColumnValue::Reference(RecordRef::Pending(head))),
            RecordWrite::create(LINES, second)
                .with_value(ColumnId::new(1), ColumnValue::Reference(RecordRef::Pending(head))),
            RecordWrite::update_pending(ORDERS, head).with_value(
                ColumnId::new(2),
                ColumnValue::MultiReference(MultiReferenceEdit::set(vec![
                    RecordRef::Pending(first),
                    RecordRef::Pending(second),
                ])),
            ),
        ],
    );

    let ids = b.submit(packet).await.unwrap().await.unwrap();
    cluster.settle(TransactionId::from_raw(1)).await;

    for replica in &cluster.replicas {
        let line = replica.read_record(LINES, ids[&first]).await.unwrap().unwrap();
        assert_eq!(
            line.values[&ColumnId::new(1)],
            ColumnValue::Reference(RecordRef::Known(ids[&head]))
        );

        let order = replica.read_record(ORDERS, ids[&head]).await.unwrap().unwrap();
        let mut lines = order.references[&ColumnId::new(2)].clone();
        lines.sort();
        let mut expected = vec![ids[&first], ids[&second]];
        expected.sort();
        assert_eq!(lines, expected);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_and_recreate_replicate() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let a = cluster.replica("a").clone();

    let (c, packet) = order(&a, "doomed");
    let id = a.submit(packet).await.unwrap().await.unwrap()[&c];

    a.submit(TransactionPacket::new(UserId::new(1), vec![RecordWrite::delete(ORDERS, id)]))
        .await
        .unwrap()
        .await
        .unwrap();
    cluster.settle(TransactionId::from_raw(2)).await;
    let deleted = cluster.replica("b").read_record(ORDERS, id).await.unwrap().unwrap();
    assert!(deleted.deleted);
    assert!(deleted.values.is_empty());

    a.submit(TransactionPacket::new(
        UserId::new(1),
        vec![RecordWrite::create_with_id(ORDERS, id, CorrelationId::new(0))
            .with_value(ColumnId::new(1), ColumnValue::Text("back".into()))],
    ))
    .await
    .unwrap()
    .await
    .unwrap();
    cluster.settle(TransactionId::from_raw(3)).await;

    let revived = cluster.replica("b").read_record(ORDERS, id).await.unwrap().unwrap();
    assert!(!revived.deleted);
    assert_eq!(revived.transaction_id, TransactionId::from_raw(3));
    assert_eq!(revived.values[&ColumnId::new(1)], ColumnValue::Text("back".into()));

    cluster.shutdown().await;
}
