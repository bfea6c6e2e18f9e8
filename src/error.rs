//! # Error Handling for ClusterDB
//!
//! A single error enum ([`Error`]) covers every failure mode of the replication
//! protocol and its collaborators. Callers match on it or propagate it with `?`.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `Display` from the `#[error(...)]` attributes and `From`
//! from the `#[from]` attributes, so storage errors convert with `?`.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Wire | Malformed packet | Drop the message, keep consuming |
//! | Resolution | Unresolved correlation, storage write | Publish an error marker, fail the submission |
//! | Consistency | Order violation | Halt the applier, page an operator |
//! | Role | Leadership lost | Stop the sequencer loop |
//! | Internal | SQLite, transport, crypto | Log and investigate |

use thiserror::Error;

use crate::types::{CorrelationId, OriginSeq, TransactionId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ClusterDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use clusterdb::{Error, Result};
///
/// async fn example(replica: &Replica, packet: TransactionPacket) -> Result<()> {
///     match replica.submit(packet).await?.await {
///         Ok(ids) => println!("assigned {:?}", ids),
///         Err(Error::TransactionRejected { origin_seq }) => {
///             println!("sequencer rejected {}", origin_seq)
///         }
///         Err(e) => return Err(e),
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    // =========================================================================
    // Wire Errors (Drop the message)
    // =========================================================================

    /// A message key or payload could not be decoded.
    ///
    /// # When This Happens
    ///
    /// - A length prefix runs past the end of the buffer
    /// - An unknown tag, kind or codec version is encountered
    /// - The payload fails authentication (wrong shared secret, tampering)
    ///
    /// # Recovery
    ///
    /// None needed. The message is skipped and logged; it never becomes a
    /// resolved transaction and never consumes a transaction id.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    // =========================================================================
    // Resolution Errors (Error marker published, submission fails)
    // =========================================================================

    /// A reference names a correlation id that no create in the packet defines.
    ///
    /// # When This Happens
    ///
    /// The submitter wrote `RecordRef::Pending(c)` (or an update/delete with
    /// record id zero and correlation `c`) without a matching create in the
    /// same packet.
    #[error("unresolved correlation id {correlation_id}")]
    UnresolvedCorrelation {
        /// The correlation id that could not be mapped to a record id
        correlation_id: CorrelationId,
    },

    /// A write failed while executing a packet; the whole packet was aborted.
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    /// The sequencer rejected this replica's submission with an error marker.
    ///
    /// # When This Happens
    ///
    /// The origin replica observed an error marker (resolved record with no
    /// payload) for one of its pending operations. The sequencer logs the
    /// underlying cause; the marker itself carries no detail.
    #[error("transaction rejected by sequencer (origin seq {origin_seq})")]
    TransactionRejected {
        /// The origin sequence of the rejected submission
        origin_seq: OriginSeq,
    },

    // =========================================================================
    // Consistency Errors (Fatal)
    // =========================================================================

    /// A resolved transaction arrived out of order.
    ///
    /// # When This Happens
    ///
    /// The applier expected `last + 1` and saw something larger. This can only
    /// happen under log loss, truncation or operator error.
    ///
    /// # Recovery
    ///
    /// The applier halts. The replica must be rebuilt or the log repaired by an
    /// operator; there is no automatic healing.
    #[error("order violation: expected transaction {expected}, but found {actual}")]
    OrderViolation {
        /// The transaction id the applier was waiting for
        expected: TransactionId,
        /// The transaction id that arrived
        actual: TransactionId,
    },

    // =========================================================================
    // Role Errors
    // =========================================================================

    /// This process stopped being the sequencer while work was in flight.
    ///
    /// Not a failure of the data path: the successor re-consumes from the last
    /// committed unresolved offset.
    #[error("leadership lost")]
    LeadershipLost,

    // =========================================================================
    // Collaborator Errors
    // =========================================================================

    /// The ordered log transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The leader election service failed.
    #[error("election error: {0}")]
    Election(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// `#[from]` generates `impl From<rusqlite::Error> for Error`, which lets
    /// `?` convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),

    /// The shared secret could not be loaded.
    #[error("key provider error: {0}")]
    KeyProvider(String),

    /// Sealing or opening a payload failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Compressing or decompressing a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// A component was used after it shut down.
    #[error("shutdown: {0}")]
    Shutdown(String),
}

impl Error {
    /// Returns true for errors that reject one packet without implicating the
    /// process that handled it.
    ///
    /// The sequencer answers these with an error marker and keeps going; any
    /// other error makes it step down.
    pub fn is_packet_rejection(&self) -> bool {
        matches!(
            self,
            Error::UnresolvedCorrelation { .. } | Error::StorageWrite(_) | Error::MalformedPacket(_)
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
