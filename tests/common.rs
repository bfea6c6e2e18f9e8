#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterdb::{
    ClusterConfig, ConsumedRecord, Database, EnvKeyProvider, Error, InMemoryLog, LocalLockService,
    LogRecord, LogTransport, MessageEnvelope, OriginSeq, PacketCipher, Replica, ReplicaId,
    Result, RetryPolicy, SequencerSeq, SqliteStorage, Storage, TransactionId, TransactionPacket,
};

pub const TOPIC_PREFIX: &str = "test";
pub const UNRESOLVED: &str = "test-unresolved";
pub const RESOLVED: &str = "test-resolved";

pub fn test_key() -> [u8; 32] {
    [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
        0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
        0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
    ]
}

pub fn test_cipher() -> PacketCipher {
    PacketCipher::new(EnvKeyProvider::from_key(test_key()))
}

pub fn test_config(name: &str) -> ClusterConfig {
    let mut config = ClusterConfig::new(name);
    config.topic_prefix = TOPIC_PREFIX.to_string();
    config.poll_timeout = Duration::from_millis(20);
    config.retry = RetryPolicy {
        base_delay: Duration::from_millis(5),
        max_retries: 3,
        max_delay: Duration::from_millis(20),
    };
    config
}

pub fn sequencer_of(name: &str) -> ReplicaId {
    test_config(name).sequencer_id
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Replicas sharing one in-memory log and lock service.
pub struct TestCluster {
    pub log: Arc<InMemoryLog>,
    pub locks: Arc<LocalLockService>,
    pub replicas: Vec<Replica>,
    transport: Arc<dyn LogTransport>,
    config: fn(&str) -> ClusterConfig,
}

impl TestCluster {
    pub fn new() -> Self {
        let log = Arc::new(InMemoryLog::new());
        Self::with_transport(log.clone(), log, test_config)
    }

    /// A cluster whose replicas reach `log` through `transport`, configured
    /// by `config`.
    pub fn with_transport(
        log: Arc<InMemoryLog>,
        transport: Arc<dyn LogTransport>,
        config: fn(&str) -> ClusterConfig,
    ) -> Self {
        Self {
            log,
            locks: Arc::new(LocalLockService::new()),
            replicas: Vec::new(),
            transport,
            config,
        }
    }

    /// Starts one in-memory replica per name. The first one leads.
    pub async fn start(names: &[&str]) -> Self {
        let mut cluster = Self::new();
        cluster.start_replicas(names).await;
        cluster
    }

    pub async fn start_replicas(&mut self, names: &[&str]) {
        for name in names {
            let storage = SqliteStorage::open_in_memory().expect("open storage");
            self.add_replica(name, Box::new(storage)).await;
        }
        self.wait_for_leader().await;
    }

    pub async fn add_replica(&mut self, name: &str, storage: Box<dyn Storage>) -> Replica {
        let replica = Replica::open(
            (self.config)(name),
            storage,
            test_cipher(),
            self.transport.clone(),
            self.locks.clone(),
        )
        .await
        .expect("open replica");
        self.replicas.push(replica.clone());
        replica
    }

    pub fn replica(&self, name: &str) -> &Replica {
        self.replicas
            .iter()
            .find(|r| r.replica_id().as_str() == name)
            .expect("unknown replica")
    }

    /// Waits until some replica is leading and returns it.
    pub async fn wait_for_leader(&self) -> Replica {
        let replicas = self.replicas.clone();
        eventually(Duration::from_secs(5), Duration::from_millis(5), || {
            replicas.iter().find(|r| r.role().is_leader()).cloned()
        })
        .await
    }

    /// Waits until every replica has applied `txn`.
    pub async fn settle(&self, txn: TransactionId) {
        for replica in &self.replicas {
            tokio::time::timeout(Duration::from_secs(10), replica.wait_for_transaction(txn))
                .await
                .expect("replica caught up in time")
                .expect("applier healthy");
        }
    }

    pub async fn shutdown(self) {
        for replica in &self.replicas {
            replica.shutdown().await;
        }
    }
}

/// Wraps an [`InMemoryLog`] and fails a chosen number of publishes or polls
/// on the resolved topic.
pub struct FlakyLog {
    pub log: Arc<InMemoryLog>,
    publish_failures: AtomicUsize,
    poll_failures: AtomicUsize,
    failed_publishes: AtomicUsize,
}

impl FlakyLog {
    pub fn new() -> Self {
        Self {
            log: Arc::new(InMemoryLog::new()),
            publish_failures: AtomicUsize::new(0),
            poll_failures: AtomicUsize::new(0),
            failed_publishes: AtomicUsize::new(0),
        }
    }

    pub fn fail_resolved_publishes(&self, count: usize) {
        self.publish_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_resolved_polls(&self, count: usize) {
        self.poll_failures.store(count, Ordering::SeqCst);
    }

    /// Resolved publishes failed so far.
    pub fn failed_publishes(&self) -> usize {
        self.failed_publishes.load(Ordering::SeqCst)
    }

    /// Resolved polls still due to fail.
    pub fn poll_failures_left(&self) -> usize {
        self.poll_failures.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LogTransport for FlakyLog {
    async fn publish(&self, topic: &str, record: LogRecord) -> Result<u64> {
        if topic == RESOLVED && take_one(&self.publish_failures) {
            self.failed_publishes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Transport("broker unavailable".into()));
        }
        self.log.publish(topic, record).await
    }

    async fn poll(
        &self,
        topic: &str,
        from: u64,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ConsumedRecord>> {
        if topic == RESOLVED && take_one(&self.poll_failures) {
            return Err(Error::Transport("broker unavailable".into()));
        }
        self.log.poll(topic, from, max, wait).await
    }

    async fn committed_offset(&self, topic: &str, group: &str) -> Result<u64> {
        self.log.committed_offset(topic, group).await
    }

    async fn commit_offset(&self, topic: &str, group: &str, next: u64) -> Result<()> {
        self.log.commit_offset(topic, group, next).await
    }

    async fn end_offset(&self, topic: &str) -> Result<u64> {
        self.log.end_offset(topic).await
    }
}

/// Publishes a sealed submission directly, bypassing `Replica::submit` and
/// its up-front checks.
pub async fn publish_unresolved(
    log: &InMemoryLog,
    origin: &str,
    origin_seq: u64,
    packet: &TransactionPacket,
) {
    let envelope = MessageEnvelope::unresolved(ReplicaId::new(origin), OriginSeq::from_raw(origin_seq));
    let sealed = test_cipher()
        .seal(&clusterdb::codec::encode_packet(packet).expect("encode packet"), &envelope)
        .expect("seal");
    log.publish(
        UNRESOLVED,
        LogRecord {
            key: envelope.encode().expect("encode key"),
            value: Some(sealed),
        },
    )
    .await
    .expect("publish");
}

/// Publishes a sealed resolved message directly, as a (possibly rogue)
/// sequencer would.
pub async fn publish_resolved(
    log: &InMemoryLog,
    origin: &str,
    origin_seq: u64,
    packet: &TransactionPacket,
) {
    let envelope = MessageEnvelope::unresolved(ReplicaId::new(origin), OriginSeq::from_raw(origin_seq))
        .resolved_by(ReplicaId::new("rogue/sequencer"), SequencerSeq::from_raw(origin_seq));
    let sealed = test_cipher()
        .seal(&clusterdb::codec::encode_packet(packet).expect("encode packet"), &envelope)
        .expect("seal");
    log.publish(
        RESOLVED,
        LogRecord {
            key: envelope.encode().expect("encode key"),
            value: Some(sealed),
        },
    )
    .await
    .expect("publish");
}
