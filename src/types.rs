//! # Domain Types for ClusterDB
//!
//! Core types of the replication protocol: identities, counters, write-sets
//! and the references that tie writes together before record ids exist.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every counter and id is wrapped in a single-field struct, so a
//! [`RecordId`] can never be passed where a [`CorrelationId`] is expected,
//! and an [`OriginSeq`] can never be confused with a [`SequencerSeq`].
//!
//! ## Invariants
//!
//! - [`TransactionId`]: strictly increasing, gap-free on every replica
//! - [`OriginSeq`]: strictly increasing per replica, never reused across restarts
//! - [`RecordRef::Pending`]: never reaches applied storage state

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

// =============================================================================
// Replica Identity
// =============================================================================

/// Stable identifier of one replica process.
///
/// A process has two identities: its replica id, stamped on everything it
/// submits, and a sequencer id used only while it holds leadership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Creates a new replica id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Counters
// =============================================================================

/// Per-replica submission sequence, minted at submit time.
///
/// Seeded from wall-clock microseconds at startup so a restarted replica never
/// reuses an identity that may still be in flight on the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OriginSeq(u64);

impl OriginSeq {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for OriginSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence stamped by the sequencer on every message it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequencerSeq(u64);

impl SequencerSeq {
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequencerSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction id assigned by the sequencer.
///
/// # Invariants
///
/// - Starts at 1; [`TransactionId::NONE`] (0) means "nothing applied yet"
/// - Every replica accepts ids strictly in `last + 1` order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TransactionId(u64);

impl TransactionId {
    /// No transaction applied yet.
    pub const NONE: TransactionId = TransactionId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Record Addressing
// =============================================================================

/// Identifies a table in the local schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(u32);

impl TableId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a column within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(u16);

impl ColumnId {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u16 {
        self.0
    }
}

/// Identifies the user on whose behalf a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UserId(u32);

impl UserId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

/// Record id within a table. Zero means "not yet assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u32);

impl RecordId {
    /// Placeholder for a record the sequencer has not numbered yet.
    pub const UNASSIGNED: RecordId = RecordId(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-local stand-in for a record id that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u32);

impl CorrelationId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest correlation id handed out before the generator wraps to 1.
pub const MAX_CORRELATION_ID: u32 = 2_000_000_000;

/// Hands out correlation ids for one replica.
///
/// Ids only need to be unique within a packet, so wrapping is harmless as
/// long as no single packet holds two billion creates.
#[derive(Debug, Default)]
pub struct CorrelationIdGenerator {
    last: AtomicU32,
}

impl CorrelationIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id in `1..=MAX_CORRELATION_ID`.
    pub fn next_id(&self) -> CorrelationId {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = if current >= MAX_CORRELATION_ID { 1 } else { current + 1 };
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return CorrelationId(next),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Correlation id to final record id, per resolved packet.
pub type CorrelationMap = HashMap<CorrelationId, RecordId>;

// =============================================================================
// References
// =============================================================================

/// A reference to another record, possibly one created in the same packet.
///
/// `Pending` exists only between submission and resolution. The resolver
/// rewrites every `Pending` to `Known`; storage rejects any that slip through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Known(RecordId),
    Pending(CorrelationId),
}

impl RecordRef {
    pub fn is_pending(&self) -> bool {
        matches!(self, RecordRef::Pending(_))
    }
}

/// Edit of a multi-reference column.
///
/// Applied in field order: clear (if `remove_all`), replace with `set` (if
/// non-empty), then `add`, then `remove`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiReferenceEdit {
    pub remove_all: bool,
    pub set: Vec<RecordRef>,
    pub add: Vec<RecordRef>,
    pub remove: Vec<RecordRef>,
}

impl MultiReferenceEdit {
    /// Replaces the whole reference set.
    pub fn set(refs: Vec<RecordRef>) -> Self {
        Self {
            set: refs,
            ..Self::default()
        }
    }

    /// Adds references to the existing set.
    pub fn add(refs: Vec<RecordRef>) -> Self {
        Self {
            add: refs,
            ..Self::default()
        }
    }

    /// Removes references from the existing set.
    pub fn remove(refs: Vec<RecordRef>) -> Self {
        Self {
            remove: refs,
            ..Self::default()
        }
    }

    /// Clears every reference.
    pub fn remove_all() -> Self {
        Self {
            remove_all: true,
            ..Self::default()
        }
    }

    pub(crate) fn refs(&self) -> impl Iterator<Item = &RecordRef> {
        self.set.iter().chain(self.add.iter()).chain(self.remove.iter())
    }

    pub(crate) fn refs_mut(&mut self) -> impl Iterator<Item = &mut RecordRef> {
        self.set
            .iter_mut()
            .chain(self.add.iter_mut())
            .chain(self.remove.iter_mut())
    }
}

// =============================================================================
// Column Values
// =============================================================================

/// A typed column value carried in a write.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
    /// Seconds since the epoch.
    Timestamp(i32),
    /// Milliseconds since the epoch.
    DateTime(i64),
    Reference(RecordRef),
    MultiReference(MultiReferenceEdit),
}

impl ColumnValue {
    pub(crate) fn refs(&self) -> Vec<&RecordRef> {
        match self {
            ColumnValue::Reference(r) => vec![r],
            ColumnValue::MultiReference(edit) => edit.refs().collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn refs_mut(&mut self) -> Vec<&mut RecordRef> {
        match self {
            ColumnValue::Reference(r) => vec![r],
            ColumnValue::MultiReference(edit) => edit.refs_mut().collect(),
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Writes and Packets
// =============================================================================

/// What a write does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// One record-level write inside a transaction packet.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub table: TableId,
    pub kind: WriteKind,
    /// Target record; [`RecordId::UNASSIGNED`] lets the sequencer pick (creates)
    /// or look it up through `correlation_id` (updates and deletes).
    pub record_id: RecordId,
    pub correlation_id: CorrelationId,
    pub values: BTreeMap<ColumnId, ColumnValue>,
}

impl RecordWrite {
    /// A create whose record id the sequencer will assign.
    pub fn create(table: TableId, correlation_id: CorrelationId) -> Self {
        Self {
            table,
            kind: WriteKind::Create,
            record_id: RecordId::UNASSIGNED,
            correlation_id,
            values: BTreeMap::new(),
        }
    }

    /// A create with an explicit record id (re-activates a deleted record).
    pub fn create_with_id(table: TableId, record_id: RecordId, correlation_id: CorrelationId) -> Self {
        Self {
            record_id,
            ..Self::create(table, correlation_id)
        }
    }

    pub fn update(table: TableId, record_id: RecordId) -> Self {
        Self {
            table,
            kind: WriteKind::Update,
            record_id,
            correlation_id: CorrelationId::new(0),
            values: BTreeMap::new(),
        }
    }

    /// An update of a record created earlier in the same packet.
    pub fn update_pending(table: TableId, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..Self::update(table, RecordId::UNASSIGNED)
        }
    }

    pub fn delete(table: TableId, record_id: RecordId) -> Self {
        Self {
            kind: WriteKind::Delete,
            ..Self::update(table, record_id)
        }
    }

    /// Sets a column value (builder style).
    pub fn with_value(mut self, column: ColumnId, value: ColumnValue) -> Self {
        self.values.insert(column, value);
        self
    }

    /// Whether this write still needs the sequencer to assign an id.
    pub fn needs_record_id(&self) -> bool {
        self.kind == WriteKind::Create && self.record_id.is_unassigned()
    }
}

/// The write-set of one transaction, before or after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionPacket {
    /// [`TransactionId::NONE`] until the sequencer resolves the packet.
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub timestamp_ms: u64,
    pub writes: Vec<RecordWrite>,
}

impl TransactionPacket {
    /// Creates an unresolved packet stamped with the current time.
    pub fn new(user_id: UserId, writes: Vec<RecordWrite>) -> Self {
        Self {
            transaction_id: TransactionId::NONE,
            user_id,
            timestamp_ms: crate::codec::current_time_ms(),
            writes,
        }
    }

    /// Correlation id to record id for every create in a resolved packet.
    pub fn correlation_map(&self) -> CorrelationMap {
        self.writes
            .iter()
            .filter(|w| w.kind == WriteKind::Create && w.correlation_id.as_raw() != 0)
            .map(|w| (w.correlation_id, w.record_id))
            .collect()
    }

    /// Checks the packet for referential completeness before it is published.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedPacket`] if a correlation id is used by two creates
    /// - [`Error::UnresolvedCorrelation`] if a pending reference, or an update
    ///   or delete without a record id, names no create in this packet
    pub fn validate(&self) -> Result<()> {
        let mut creates = HashSet::new();
        for write in &self.writes {
            if write.kind == WriteKind::Create && write.correlation_id.as_raw() != 0
                && !creates.insert(write.correlation_id)
            {
                return Err(Error::MalformedPacket(format!(
                    "duplicate correlation id {}",
                    write.correlation_id
                )));
            }
        }

        for write in &self.writes {
            if write.kind != WriteKind::Create
                && write.record_id.is_unassigned()
                && !creates.contains(&write.correlation_id)
            {
                return Err(Error::UnresolvedCorrelation {
                    correlation_id: write.correlation_id,
                });
            }
            for value in write.values.values() {
                for r in value.refs() {
                    if let RecordRef::Pending(c) = r {
                        if !creates.contains(c) {
                            return Err(Error::UnresolvedCorrelation { correlation_id: *c });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether every id and reference in the packet is final.
    pub fn is_resolved(&self) -> bool {
        !self.transaction_id.is_none()
            && self.writes.iter().all(|w| {
                !w.record_id.is_unassigned()
                    && w.values
                        .values()
                        .all(|v| v.refs().iter().all(|r| !r.is_pending()))
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
