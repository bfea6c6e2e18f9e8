//! # Storage Writer Actor
//!
//! Local storage is owned by one dedicated OS thread. Every request that
//! touches it (resolution rehearsals, applies, reads) goes through a channel
//! and is answered on a oneshot, so there is never more than one writer.
//!
//! ```text
//!   sequencer task ──┐
//!   applier task ────┼──► mpsc ──► [clusterdb-storage-writer thread] ──► Storage
//!   Replica::read ───┘      ▲               │
//!                           └── oneshot ◄───┘
//! ```
//!
//! ## Why a Thread, Not a Task?
//!
//! SQLite calls block. Running them on a dedicated thread keeps the async
//! runtime's workers free, and makes the single-writer rule structural rather
//! than a convention.
//!
//! ## Invariants
//!
//! - Requests are handled strictly in arrival order
//! - The cached last-applied id is updated only after a successful commit
//!   (memory may lag disk, never lead it)

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resolver::{self, ResolvedTransaction};
use crate::storage::{Storage, StoredRecord};
use crate::types::{RecordId, TableId, TransactionId, TransactionPacket};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the storage writer.
pub enum WriteRequest {
    /// Rehearse a packet against current state (nothing is committed).
    Resolve {
        packet: TransactionPacket,
        response: oneshot::Sender<Result<ResolvedTransaction>>,
    },

    /// Apply and commit a resolved packet.
    Apply {
        packet: TransactionPacket,
        response: oneshot::Sender<Result<()>>,
    },

    /// Last committed transaction id.
    LastApplied {
        response: oneshot::Sender<Result<TransactionId>>,
    },

    /// Read one record.
    ReadRecord {
        table: TableId,
        record_id: RecordId,
        response: oneshot::Sender<Result<Option<StoredRecord>>>,
    },

    /// Stop the writer thread.
    Shutdown,
}

// =============================================================================
// Storage Writer
// =============================================================================

struct StorageWriter {
    storage: Box<dyn Storage>,
    last_applied: TransactionId,
}

impl StorageWriter {
    fn new(storage: Box<dyn Storage>) -> Result<Self> {
        let last_applied = storage.last_committed_transaction_id()?;
        Ok(Self {
            storage,
            last_applied,
        })
    }

    fn resolve(&mut self, packet: TransactionPacket) -> Result<ResolvedTransaction> {
        resolver::resolve(self.storage.as_mut(), packet)
    }

    fn apply(&mut self, packet: &TransactionPacket) -> Result<()> {
        resolver::apply(self.storage.as_mut(), packet)?;
        self.last_applied = packet.transaction_id;
        debug!(txn_id = %packet.transaction_id, writes = packet.writes.len(), "transaction committed");
        Ok(())
    }

    fn run(mut self, mut rx: mpsc::Receiver<WriteRequest>) {
        while let Some(request) = rx.blocking_recv() {
            match request {
                WriteRequest::Resolve { packet, response } => {
                    let _ = response.send(self.resolve(packet));
                }
                WriteRequest::Apply { packet, response } => {
                    let _ = response.send(self.apply(&packet));
                }
                WriteRequest::LastApplied { response } => {
                    let _ = response.send(Ok(self.last_applied));
                }
                WriteRequest::ReadRecord {
                    table,
                    record_id,
                    response,
                } => {
                    let _ = response.send(self.storage.read_record(table, record_id));
                }
                WriteRequest::Shutdown => break,
            }
        }
        if let Err(e) = self.storage.rollback() {
            warn!(error = %e, "rollback on storage writer exit failed");
        }
        debug!("storage writer stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to the storage writer thread.
#[derive(Clone)]
pub struct StorageWriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl StorageWriterHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Shutdown("storage writer has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Shutdown("storage writer dropped response".to_string()))?
    }

    /// Rehearses `packet` and returns its resolved form.
    pub async fn resolve(&self, packet: TransactionPacket) -> Result<ResolvedTransaction> {
        self.call(|response| WriteRequest::Resolve { packet, response })
            .await
    }

    /// Applies and commits a resolved packet.
    pub async fn apply(&self, packet: TransactionPacket) -> Result<()> {
        self.call(|response| WriteRequest::Apply { packet, response })
            .await
    }

    pub async fn last_applied(&self) -> Result<TransactionId> {
        self.call(|response| WriteRequest::LastApplied { response })
            .await
    }

    pub async fn read_record(
        &self,
        table: TableId,
        record_id: RecordId,
    ) -> Result<Option<StoredRecord>> {
        self.call(|response| WriteRequest::ReadRecord {
            table,
            record_id,
            response,
        })
        .await
    }

    /// Asks the writer thread to stop. Pending requests ahead of it still run.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

/// Spawns the storage writer on its own thread.
pub fn spawn_storage_writer(storage: Box<dyn Storage>) -> Result<StorageWriterHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

    let writer = StorageWriter::new(storage)?;

    std::thread::Builder::new()
        .name("clusterdb-storage-writer".to_string())
        .spawn(move || writer.run(rx))
        .map_err(|e| Error::Schema(format!("failed to spawn storage writer thread: {}", e)))?;

    Ok(StorageWriterHandle { tx })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use crate::types::{ColumnId, ColumnValue, CorrelationId, RecordWrite, UserId};

    const T: TableId = TableId::new(2);

    fn spawn() -> StorageWriterHandle {
        spawn_storage_writer(Box::new(SqliteStorage::open_in_memory().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_then_apply() {
        let handle = spawn();
        let packet = TransactionPacket::new(
            UserId::new(1),
            vec![RecordWrite::create(T, CorrelationId::new(5))
                .with_value(ColumnId::new(1), ColumnValue::Bool(true))],
        );

        let resolved = handle.resolve(packet).await.unwrap();
        assert_eq!(handle.last_applied().await.unwrap(), TransactionId::NONE);

        handle.apply(resolved.packet.clone()).await.unwrap();
        assert_eq!(handle.last_applied().await.unwrap(), TransactionId::from_raw(1));

        let id = resolved.correlations[&CorrelationId::new(5)];
        let rec = handle.read_record(T, id).await.unwrap().unwrap();
        assert_eq!(rec.values[&ColumnId::new(1)], ColumnValue::Bool(true));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_last_applied() {
        let handle = spawn();
        let mut packet = TransactionPacket::new(
            UserId::new(1),
            vec![RecordWrite::update(T, RecordId::new(9))],
        );
        packet.transaction_id = TransactionId::from_raw(1);

        assert!(matches!(handle.apply(packet).await, Err(Error::StorageWrite(_))));
        assert_eq!(handle.last_applied().await.unwrap(), TransactionId::NONE);
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let handle = spawn();
        handle.shutdown().await;

        let err = handle.last_applied().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown(_)));
    }

    #[tokio::test]
    async fn test_reopen_restores_last_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");

        {
            let handle = spawn_storage_writer(Box::new(SqliteStorage::open(&path).unwrap())).unwrap();
            let resolved = handle
                .resolve(TransactionPacket::new(UserId::new(1), vec![RecordWrite::create(T, CorrelationId::new(1))]))
                .await
                .unwrap();
            handle.apply(resolved.packet).await.unwrap();
            handle.shutdown().await;
        }

        let handle = spawn_storage_writer(Box::new(SqliteStorage::open(&path).unwrap())).unwrap();
        assert_eq!(handle.last_applied().await.unwrap(), TransactionId::from_raw(1));
    }
}
