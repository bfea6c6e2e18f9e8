//! # Replica Handle
//!
//! [`Replica`] is the public async interface of one ClusterDB process. It
//! wires the storage writer, the applier, the election participant and (while
//! leading) the sequencer together, and exposes submission and reads.
//!
//! ## Moving Parts
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               Tokio Runtime                                │
//! │                                                                           │
//! │  caller tasks ──submit──► seal + publish ─────────► <prefix>-unresolved   │
//! │       ▲                                                    │              │
//! │       │ SubmitHandle                                        ▼              │
//! │  ┌────┴──────────┐      ┌──────────────┐  leader only ┌───────────┐       │
//! │  │ PendingTable  │◄─────│   Applier    │◄──resolved───│ Sequencer │       │
//! │  └───────────────┘      └──────┬───────┘              └─────┬─────┘       │
//! │                                │                            │             │
//! │  role driver ── election events ── starts / stops ──────────┘             │
//! └────────────────────────────────┼────────────────────────────┼─────────────┘
//!                                  ▼                            ▼
//!                       ┌──────────────────────────────────────────────┐
//!                       │  Storage writer (dedicated OS thread)        │
//!                       │  apply / resolve rehearsal / reads           │
//!                       └──────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Lifecycle
//!
//! 1. `submit` checks the packet, mints the next origin sequence, seals the
//!    payload and publishes it to the unresolved log. Minting, registration
//!    and publication happen under one async mutex.
//! 2. The sequencer resolves it and publishes the result (or an error marker)
//!    to the resolved log.
//! 3. This replica's applier applies it like any other transaction, then
//!    completes the [`SubmitHandle`] with the assigned record ids.
//!
//! There is no protocol-level timeout: while no sequencer exists, handles
//! simply wait.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::applier::{wait_for_progress, ApplierProgress, ReplicaApplier};
use crate::codec::{current_time_micros, encode_packet};
use crate::config::ClusterConfig;
use crate::crypto::PacketCipher;
use crate::election::{ElectionEvent, LeaderElection, LeadershipState};
use crate::envelope::MessageEnvelope;
use crate::error::{Error, Result};
use crate::pending::{PendingTable, ResolvedOrigins, SubmitHandle};
use crate::sequencer::Sequencer;
use crate::signal::{stop_signal, StopHandle, StopSignal};
use crate::storage::{SqliteStorage, Storage, StoredRecord};
use crate::transport::{with_retry, LogRecord, LogTransport, Topics};
use crate::types::{
    CorrelationId, CorrelationIdGenerator, OriginSeq, RecordId, ReplicaId, TableId, TransactionId,
    TransactionPacket,
};
use crate::writer::{spawn_storage_writer, StorageWriterHandle};

// =============================================================================
// Replica
// =============================================================================

/// Async handle to one replica of a ClusterDB cluster.
///
/// `Replica` is `Clone`, `Send` and `Sync`; all clones share the same
/// background tasks.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use clusterdb::{
///     ClusterConfig, ColumnId, ColumnValue, InMemoryLog, LocalLockService, PacketCipher,
///     RecordWrite, Replica, SqliteStorage, TableId, TransactionPacket, UserId,
/// };
///
/// let replica = Replica::open(
///     ClusterConfig::new("node-1"),
///     Box::new(SqliteStorage::open("node-1.db")?),
///     PacketCipher::from_env()?,
///     Arc::new(InMemoryLog::new()),
///     Arc::new(LocalLockService::new()),
/// )
/// .await?;
///
/// let order = replica.next_correlation_id();
/// let packet = TransactionPacket::new(
///     UserId::new(1),
///     vec![RecordWrite::create(TableId::new(1), order)
///         .with_value(ColumnId::new(1), ColumnValue::Text("hello".into()))],
/// );
/// let ids = replica.submit(packet).await?.await?;
/// println!("created record {}", ids[&order]);
///
/// replica.shutdown().await;
/// ```
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

struct ReplicaInner {
    config: ClusterConfig,
    topics: Topics,
    transport: Arc<dyn LogTransport>,
    cipher: PacketCipher,
    writer: StorageWriterHandle,
    pending: Arc<PendingTable>,
    correlations: CorrelationIdGenerator,

    /// Next origin sequence; the lock also serializes publication.
    next_origin_seq: Mutex<OriginSeq>,

    progress: watch::Receiver<ApplierProgress>,
    role: watch::Receiver<LeadershipState>,
    stop: StopHandle,
    stopped: StopSignal,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Replica {
    /// Starts a replica on top of the given collaborators.
    ///
    /// Spawns the storage writer thread, the applier task and the role
    /// driver, and joins the election as `config.sequencer_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid
    /// - [`Error::Sqlite`] if the last committed transaction cannot be read
    /// - [`Error::Election`] if joining the election fails
    pub async fn open(
        config: ClusterConfig,
        storage: Box<dyn Storage>,
        cipher: PacketCipher,
        transport: Arc<dyn LogTransport>,
        election: Arc<dyn LeaderElection>,
    ) -> Result<Self> {
        config.validate()?;

        let writer = spawn_storage_writer(storage)?;
        let pending = Arc::new(PendingTable::new());
        let resolved_origins = Arc::new(ResolvedOrigins::new(config.resolved_origin_cache));
        let (progress_tx, progress_rx) = watch::channel(ApplierProgress::default());
        let (role_tx, role_rx) = watch::channel(LeadershipState::Follower);
        let (stop, stopped) = stop_signal();

        let applier = ReplicaApplier::new(
            config.clone(),
            transport.clone(),
            cipher.clone(),
            writer.clone(),
            pending.clone(),
            resolved_origins.clone(),
            progress_tx,
        );
        let applier_task = tokio::spawn(applier.run(stopped.clone()));

        let events = match election.join(&config.sequencer_id).await {
            Ok(events) => events,
            Err(e) => {
                stop.stop();
                writer.shutdown().await;
                return Err(e);
            }
        };
        let driver = RoleDriver {
            config: config.clone(),
            transport: transport.clone(),
            cipher: cipher.clone(),
            writer: writer.clone(),
            resolved_origins,
            election,
            applier: progress_rx.clone(),
            role: role_tx,
            state: LeadershipState::Follower,
            leading: None,
        };
        let driver_task = tokio::spawn(driver.run(events, stopped.clone()));

        info!(replica = %config.replica_id, sequencer = %config.sequencer_id, "replica opened");

        Ok(Self {
            inner: Arc::new(ReplicaInner {
                topics: Topics::new(&config.topic_prefix),
                config,
                transport,
                cipher,
                writer,
                pending,
                correlations: CorrelationIdGenerator::new(),
                next_origin_seq: Mutex::new(OriginSeq::from_raw(current_time_micros())),
                progress: progress_rx,
                role: role_rx,
                stop,
                stopped,
                tasks: Mutex::new(vec![applier_task, driver_task]),
            }),
        })
    }

    /// Opens a replica backed by a SQLite file, with the shared secret taken
    /// from `CLUSTERDB_SHARED_SECRET`.
    pub async fn open_path<P: AsRef<Path>>(
        config: ClusterConfig,
        path: P,
        transport: Arc<dyn LogTransport>,
        election: Arc<dyn LeaderElection>,
    ) -> Result<Self> {
        let cipher = PacketCipher::from_env()?;
        let storage = SqliteStorage::open(path)?;
        Self::open(config, Box::new(storage), cipher, transport, election).await
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.inner.config.replica_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Next correlation id for a create in a packet built by this replica.
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.inner.correlations.next_id()
    }

    /// Publishes `packet` to the unresolved log.
    ///
    /// Returns once the packet is on the log; await the returned handle for
    /// the record ids assigned to the packet's creates.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedPacket`] if two creates share a correlation id or
    ///   the packet already carries a transaction id
    /// - [`Error::UnresolvedCorrelation`] if a reference names no create
    /// - [`Error::Transport`] if publishing fails after all retries
    /// - [`Error::Shutdown`] after [`Replica::shutdown`]
    ///
    /// The handle itself fails with [`Error::TransactionRejected`] if the
    /// sequencer rejects the packet.
    pub async fn submit(&self, packet: TransactionPacket) -> Result<SubmitHandle> {
        if self.inner.stopped.is_stopped() {
            return Err(Error::Shutdown("replica is shut down".into()));
        }
        if self.progress().halted {
            return Err(Error::Shutdown("applier halted".into()));
        }
        packet.validate()?;
        if !packet.transaction_id.is_none() {
            return Err(Error::MalformedPacket(format!(
                "submitted packet already carries transaction {}",
                packet.transaction_id
            )));
        }
        let payload = encode_packet(&packet)?;

        let mut next_origin_seq = self.inner.next_origin_seq.lock().await;
        let origin_seq = *next_origin_seq;
        *next_origin_seq = origin_seq.next();

        let envelope = MessageEnvelope::unresolved(self.inner.config.replica_id.clone(), origin_seq);
        let record = LogRecord {
            key: envelope.encode()?,
            value: Some(self.inner.cipher.seal(&payload, &envelope)?),
        };
        // Registered before publishing so the resolution cannot outrun it; the
        // guard drops the entry if publishing fails or this future is dropped.
        let (handle, guard) = self.inner.pending.register_guarded(envelope.pending_key());

        let transport = &self.inner.transport;
        let topic = self.inner.topics.unresolved.as_str();
        let offset =
            with_retry(&self.inner.config.retry, "publish", || transport.publish(topic, record.clone())).await?;
        guard.keep();
        debug!(replica = %self.inner.config.replica_id, origin_seq = %origin_seq, offset, "transaction submitted");
        Ok(handle)
    }

    /// Last transaction committed to local storage.
    pub async fn last_applied(&self) -> Result<TransactionId> {
        self.inner.writer.last_applied().await
    }

    /// Reads one record from local storage. Deleted records are returned
    /// with `deleted` set.
    pub async fn read_record(&self, table: TableId, record_id: RecordId) -> Result<Option<StoredRecord>> {
        self.inner.writer.read_record(table, record_id).await
    }

    /// Current leadership state of this process.
    pub fn role(&self) -> LeadershipState {
        *self.inner.role.borrow()
    }

    pub fn progress(&self) -> ApplierProgress {
        self.inner.progress.borrow().clone()
    }

    /// Waits until the applier has applied `txn` locally.
    ///
    /// # Errors
    ///
    /// [`Error::Shutdown`] if the applier halts or the replica shuts down
    /// first.
    pub async fn wait_for_transaction(&self, txn: TransactionId) -> Result<()> {
        let mut progress = self.inner.progress.clone();
        let mut stopped = self.inner.stopped.clone();
        tokio::select! {
            _ = stopped.stopped() => Err(Error::Shutdown("replica is shut down".into())),
            seen = wait_for_progress(&mut progress, |p| p.last_transaction_id >= txn) => seen.map(|_| ()),
        }
    }

    /// Number of submissions still waiting for their resolved message.
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stops every background task and the storage writer.
    ///
    /// Outstanding submit handles fail with [`Error::Shutdown`]. Leadership,
    /// if held, is given up.
    pub async fn shutdown(&self) {
        self.inner.stop.stop();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(replica = %self.inner.config.replica_id, error = %e, "task ended with error"),
                Err(e) => error!(replica = %self.inner.config.replica_id, error = %e, "task panicked"),
            }
        }

        self.inner.pending.fail_all("replica shut down");
        self.inner.writer.shutdown().await;
        info!(replica = %self.inner.config.replica_id, "replica shut down");
    }
}

// =============================================================================
// Role Driver
// =============================================================================

struct Leading {
    stop: StopHandle,
    task: JoinHandle<Result<()>>,
}

/// Follows election events and starts or stops the sequencer accordingly.
struct RoleDriver {
    config: ClusterConfig,
    transport: Arc<dyn LogTransport>,
    cipher: PacketCipher,
    writer: StorageWriterHandle,
    resolved_origins: Arc<ResolvedOrigins>,
    election: Arc<dyn LeaderElection>,
    applier: watch::Receiver<ApplierProgress>,
    role: watch::Sender<LeadershipState>,
    state: LeadershipState,
    leading: Option<Leading>,
}

impl RoleDriver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ElectionEvent>,
        mut stop: StopSignal,
    ) -> Result<()> {
        let mut applier = self.applier.clone();
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                halted = wait_for_progress(&mut applier, |p| p.halted) => {
                    // An `Err` means the applier is gone, which happens on shutdown.
                    if halted.is_ok() {
                        error!(sequencer = %self.config.sequencer_id, "applier halted, leaving election");
                    }
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        warn!(sequencer = %self.config.sequencer_id, "election event stream closed");
                        break;
                    }
                },
                outcome = join_sequencer(&mut self.leading) => {
                    self.leading = None;
                    if !self.on_sequencer_exit(outcome).await {
                        break;
                    }
                }
            }
        }

        self.stop_sequencer().await;
        if let Err(e) = self.election.leave(&self.config.sequencer_id).await {
            warn!(sequencer = %self.config.sequencer_id, error = %e, "failed to leave election");
        }
        self.role.send_replace(LeadershipState::Follower);
        Ok(())
    }

    async fn on_event(&mut self, event: ElectionEvent) {
        let next = self.state.on_event(event);
        if next == self.state {
            return;
        }
        info!(sequencer = %self.config.sequencer_id, from = ?self.state, to = ?next, "leadership changed");

        let was_leader = self.state.is_leader();
        self.state = next;
        self.role.send_replace(next);
        if was_leader {
            self.stop_sequencer().await;
        }
        if let LeadershipState::Leader { fencing_token } = next {
            self.start_sequencer(fencing_token);
        }
    }

    fn start_sequencer(&mut self, fencing_token: u64) {
        let (stop, signal) = stop_signal();
        let sequencer = Sequencer::new(
            self.config.clone(),
            fencing_token,
            self.transport.clone(),
            self.cipher.clone(),
            self.writer.clone(),
            self.resolved_origins.clone(),
            self.applier.clone(),
        );
        let task = tokio::spawn(sequencer.run(signal));
        self.leading = Some(Leading { stop, task });
    }

    async fn stop_sequencer(&mut self) {
        if let Some(leading) = self.leading.take() {
            leading.stop.stop();
            if let Ok(Err(e)) = leading.task.await {
                warn!(sequencer = %self.config.sequencer_id, error = %e, "sequencer failed while stopping");
            }
        }
    }

    /// Handles a sequencer that ended on its own. Returns `false` if this
    /// process should stop taking part in the election.
    async fn on_sequencer_exit(&mut self, outcome: std::result::Result<Result<()>, JoinError>) -> bool {
        match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => error!(sequencer = %self.config.sequencer_id, error = %e, "sequencer failed, stepping down"),
            Err(e) => error!(sequencer = %self.config.sequencer_id, error = %e, "sequencer panicked, stepping down"),
        }

        if self.applier.borrow().halted {
            // Cannot lead with a halted applier; let someone else have it.
            error!(sequencer = %self.config.sequencer_id, "applier halted, leaving election");
            return false;
        }
        if let Err(e) = self.election.release(&self.config.sequencer_id).await {
            error!(sequencer = %self.config.sequencer_id, error = %e, "failed to release leadership");
            return false;
        }
        true
    }
}

async fn join_sequencer(leading: &mut Option<Leading>) -> std::result::Result<Result<()>, JoinError> {
    match leading {
        Some(leading) => (&mut leading.task).await,
        None => futures::future::pending().await,
    }
}
