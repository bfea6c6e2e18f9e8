//! # ClusterDB - Replicated Record Store
//!
//! ClusterDB keeps a record database identical on every replica of a cluster
//! by funnelling all writes through a single sequencer. It provides:
//!
//! - **Total order**: every replica applies the same transactions in the same order
//! - **Gap-free transaction ids**: rejected packets never consume an id
//! - **Client-side record creation**: correlation ids stand in for record ids
//!   until the sequencer assigns the real ones
//! - **Failover**: any replica can take over sequencing through leader election
//! - **Sealed payloads**: packets are compressed and authenticated-encrypted on the log
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   submit    ┌──────────────────────┐
//! │  Replica A   │────────────►│ <prefix>-unresolved  │
//! │  Replica B   │             └──────────┬───────────┘
//! │  Replica C   │                        │ poll (leader only)
//! └──────▲───────┘                        ▼
//!        │                     ┌──────────────────────┐
//!        │                     │      Sequencer       │
//!        │                     │ resolve ids, txn id  │
//!        │                     └──────────┬───────────┘
//!        │  apply (every replica)         │ publish
//!        │                     ┌──────────▼───────────┐
//!        └─────────────────────│  <prefix>-resolved   │
//!                              └──────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single sequencer**: only the election lock holder publishes resolved messages
//! 2. **Contiguous ids**: a replica applies transaction `n + 1` only after `n`
//! 3. **Atomic packets**: a packet's writes and its transaction id commit together
//! 4. **Memory safety**: in-memory state may lag disk, but never leads disk
//! 5. **Exactly-once completion**: each submission completes its caller once
//!
//! ## Module Organization
//!
//! - [`error`]: Custom error types for all failure modes
//! - [`types`]: Domain types (ids, column values, writes, packets)
//! - [`codec`]: Packet wire format
//! - [`envelope`]: Log record keys
//! - [`crypto`]: Payload compression and encryption
//! - [`schema`] / [`storage`]: SQLite-backed local storage
//! - [`resolver`]: Id assignment and write execution
//! - [`writer`]: Storage writer thread
//! - [`transport`] / [`election`]: Collaborator traits and in-process implementations
//! - [`applier`] / `sequencer`: The two replication loops
//! - [`api`]: Async API (main entry point)

/// Error types for ClusterDB operations.
pub mod error;

/// Domain types: identifiers, column values, record writes and packets.
///
/// Uses the newtype pattern so a record id can never be passed where a
/// correlation id is expected.
pub mod types;

/// Transaction packet encoding and decoding.
///
/// The layout is part of the compatibility surface: every process in a
/// cluster must agree on it byte for byte.
pub mod codec;

/// Message envelopes, the keys of log records.
pub mod envelope;

/// Zstd compression plus AES-256-GCM encryption of log payloads.
pub mod crypto;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// The local storage trait and its SQLite implementation.
pub mod storage;

/// Turns unresolved packets into resolved ones.
pub mod resolver;

/// Dedicated thread owning local storage.
pub mod writer;

/// Replica configuration and retry policy.
pub mod config;

/// Stop signals for background loops.
pub mod signal;

/// Ordered log transport and the in-memory implementation.
pub mod transport;

/// Leader election state machine and the local lock service.
pub mod election;

/// Outstanding submissions and duplicate suppression.
pub mod pending;

/// Applies the resolved log to local storage.
pub mod applier;

/// Resolves the unresolved log while this process leads.
mod sequencer;

/// Async API for ClusterDB.
///
/// The main entry point is [`Replica`](api::Replica).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Replica;
pub use applier::ApplierProgress;
pub use config::{ClusterConfig, RetryPolicy};
pub use crypto::{EnvKeyProvider, KeyProvider, PacketCipher};
pub use election::{ElectionEvent, LeaderElection, LeadershipState, LocalLockService};
pub use envelope::{MessageEnvelope, MessageKind, PendingKey, SequencerStamp};
pub use error::{Error, Result};
pub use pending::SubmitHandle;
pub use schema::Database;
pub use signal::{stop_signal, StopHandle, StopSignal};
pub use storage::{SqliteStorage, Storage, StoredRecord};
pub use transport::{ConsumedRecord, InMemoryLog, LogRecord, LogTransport, Topics};

pub use types::{
    ColumnId, ColumnValue, CorrelationId, CorrelationMap, MultiReferenceEdit, OriginSeq, RecordId,
    RecordRef, RecordWrite, ReplicaId, SequencerSeq, TableId, TransactionId, TransactionPacket,
    UserId, WriteKind,
};
