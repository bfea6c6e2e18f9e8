//! # Local Storage Layer
//!
//! The storage engine each replica applies resolved transactions to. The
//! protocol only needs the narrow [`Storage`] trait; [`SqliteStorage`] is the
//! engine shipped with the crate.
//!
//! ## Design: Single-Writer Architecture
//!
//! A `Storage` is owned by exactly one thread (the storage writer, see
//! [`crate::writer`]). Nothing else mutates local state, so there is no
//! locking inside the engine.
//!
//! ## Packet Atomicity
//!
//! Each packet runs inside one SAVEPOINT:
//!
//! ```text
//! begin()            SAVEPOINT packet
//! assign/apply ...
//! commit(txn)        UPDATE replica_state; RELEASE packet
//!   or rollback()    ROLLBACK TO packet; RELEASE packet
//! ```
//!
//! The last applied transaction id is written inside the same SAVEPOINT as the
//! data, so a crash can never leave one without the other.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{decode_column_value, encode_column_value};
use crate::error::{Error, Result};
use crate::schema::Database;
use crate::types::{
    ColumnId, ColumnValue, MultiReferenceEdit, RecordId, RecordRef, RecordWrite, TableId,
    TransactionId, UserId, WriteKind,
};

const PACKET_SAVEPOINT: &str = "packet";

// =============================================================================
// Storage Trait
// =============================================================================

/// Operations the replication protocol needs from a storage engine.
///
/// Callers bracket every packet with [`begin`](Storage::begin) and exactly one
/// of [`commit`](Storage::commit) or [`rollback`](Storage::rollback).
pub trait Storage: Send {
    /// Opens an atomic scope for one packet.
    fn begin(&mut self) -> Result<()>;

    /// Makes the scope durable and records `txn` as the last applied id.
    ///
    /// # Errors
    ///
    /// [`Error::OrderViolation`] if `txn` is not exactly `last + 1`.
    fn commit(&mut self, txn: TransactionId) -> Result<()>;

    /// Discards everything done since [`begin`](Storage::begin).
    fn rollback(&mut self) -> Result<()>;

    /// Hands out the next record id of `table`.
    fn assign_record_id(&mut self, table: TableId) -> Result<RecordId>;

    /// Applies one fully resolved write.
    fn apply_write(&mut self, txn: TransactionId, user: UserId, write: &RecordWrite) -> Result<()>;

    /// Id of the last transaction committed locally.
    fn last_committed_transaction_id(&self) -> Result<TransactionId>;

    /// Reads a record, deleted or not.
    fn read_record(&self, table: TableId, record_id: RecordId) -> Result<Option<StoredRecord>>;
}

/// A record as held in local storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub table: TableId,
    pub record_id: RecordId,
    pub user_id: UserId,
    /// Global transaction that last wrote the record.
    pub transaction_id: TransactionId,
    pub deleted: bool,
    pub values: BTreeMap<ColumnId, ColumnValue>,
    /// Members of multi-reference columns, sorted by id.
    pub references: BTreeMap<ColumnId, Vec<RecordId>>,
}

// =============================================================================
// SQLite Storage
// =============================================================================

/// [`Storage`] backed by SQLite.
pub struct SqliteStorage {
    conn: Connection,
    in_packet: bool,
}

impl SqliteStorage {
    /// Wraps an initialized database.
    pub fn new(db: Database) -> Self {
        Self {
            conn: db.into_connection(),
            in_packet: false,
        }
    }

    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    /// In-memory storage for tests and simulations.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn require_packet(&self) -> Result<()> {
        if !self.in_packet {
            return Err(Error::StorageWrite("write outside of a packet scope".into()));
        }
        Ok(())
    }

    /// Returns `Some(deleted)` if the record row exists.
    fn record_state(&self, table: TableId, record_id: RecordId) -> Result<Option<bool>> {
        let deleted: Option<bool> = self
            .conn
            .query_row(
                "SELECT deleted FROM records WHERE table_id = ?1 AND record_id = ?2",
                params![table.as_raw(), record_id.as_raw()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(deleted)
    }

    fn clear_record_data(&self, table: TableId, record_id: RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM record_values WHERE table_id = ?1 AND record_id = ?2",
            params![table.as_raw(), record_id.as_raw()],
        )?;
        self.conn.execute(
            "DELETE FROM record_references WHERE table_id = ?1 AND record_id = ?2",
            params![table.as_raw(), record_id.as_raw()],
        )?;
        Ok(())
    }

    /// Keeps the table sequence ahead of explicitly chosen ids.
    fn bump_sequence(&self, table: TableId, record_id: RecordId) -> Result<()> {
        self.conn.execute(
            "INSERT INTO table_sequences (table_id, next_record_id) VALUES (?1, ?2)
             ON CONFLICT(table_id) DO UPDATE SET next_record_id = MAX(next_record_id, excluded.next_record_id)",
            params![table.as_raw(), record_id.as_raw() as i64 + 1],
        )?;
        Ok(())
    }

    fn write_values(&self, write: &RecordWrite) -> Result<()> {
        let (table, record) = (write.table.as_raw(), write.record_id.as_raw());

        for (column, value) in &write.values {
            let column_raw = column.as_raw();
            match value {
                ColumnValue::Null => {
                    self.conn.execute(
                        "DELETE FROM record_values WHERE table_id = ?1 AND record_id = ?2 AND column_id = ?3",
                        params![table, record, column_raw],
                    )?;
                    self.conn.execute(
                        "DELETE FROM record_references WHERE table_id = ?1 AND record_id = ?2 AND column_id = ?3",
                        params![table, record, column_raw],
                    )?;
                }
                ColumnValue::MultiReference(edit) => {
                    self.apply_multi_reference(write.table, write.record_id, *column, edit)?;
                }
                other => {
                    self.conn.execute(
                        "INSERT INTO record_values (table_id, record_id, column_id, value) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(table_id, record_id, column_id) DO UPDATE SET value = excluded.value",
                        params![table, record, column_raw, encode_column_value(other)?],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn apply_multi_reference(
        &self,
        table: TableId,
        record_id: RecordId,
        column: ColumnId,
        edit: &MultiReferenceEdit,
    ) -> Result<()> {
        let (t, r, c) = (table.as_raw(), record_id.as_raw(), column.as_raw());

        if edit.remove_all || !edit.set.is_empty() {
            self.conn.execute(
                "DELETE FROM record_references WHERE table_id = ?1 AND record_id = ?2 AND column_id = ?3",
                params![t, r, c],
            )?;
        }
        for target in edit.set.iter().chain(edit.add.iter()) {
            self.conn.execute(
                "INSERT OR IGNORE INTO record_references (table_id, record_id, column_id, target_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![t, r, c, known(target)?.as_raw()],
            )?;
        }
        for target in &edit.remove {
            self.conn.execute(
                "DELETE FROM record_references
                 WHERE table_id = ?1 AND record_id = ?2 AND column_id = ?3 AND target_id = ?4",
                params![t, r, c, known(target)?.as_raw()],
            )?;
        }
        Ok(())
    }
}

fn known(r: &RecordRef) -> Result<RecordId> {
    match r {
        RecordRef::Known(id) => Ok(*id),
        RecordRef::Pending(c) => Err(Error::StorageWrite(format!(
            "unresolved reference to correlation {} reached storage",
            c
        ))),
    }
}

impl Storage for SqliteStorage {
    fn begin(&mut self) -> Result<()> {
        if self.in_packet {
            return Err(Error::StorageWrite("packet scope already open".into()));
        }
        self.conn.execute_batch(&format!("SAVEPOINT {}", PACKET_SAVEPOINT))?;
        self.in_packet = true;
        Ok(())
    }

    fn commit(&mut self, txn: TransactionId) -> Result<()> {
        self.require_packet()?;
        let expected = self.last_committed_transaction_id()?.next();
        if txn != expected {
            return Err(Error::OrderViolation {
                expected,
                actual: txn,
            });
        }
        self.conn.execute(
            "UPDATE replica_state SET last_transaction_id = ?1 WHERE id = 1",
            params![txn.as_raw() as i64],
        )?;
        self.conn.execute_batch(&format!("RELEASE {}", PACKET_SAVEPOINT))?;
        self.in_packet = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_packet {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "ROLLBACK TO {sp}; RELEASE {sp}",
            sp = PACKET_SAVEPOINT
        ))?;
        self.in_packet = false;
        Ok(())
    }

    fn assign_record_id(&mut self, table: TableId) -> Result<RecordId> {
        self.require_packet()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO table_sequences (table_id, next_record_id) VALUES (?1, 1)",
            params![table.as_raw()],
        )?;
        let next: i64 = self.conn.query_row(
            "SELECT next_record_id FROM table_sequences WHERE table_id = ?1",
            params![table.as_raw()],
            |row| row.get(0),
        )?;
        let id = u32::try_from(next)
            .map_err(|_| Error::StorageWrite(format!("record ids exhausted for table {}", table)))?;
        self.conn.execute(
            "UPDATE table_sequences SET next_record_id = ?2 WHERE table_id = ?1",
            params![table.as_raw(), next + 1],
        )?;
        Ok(RecordId::new(id))
    }

    fn apply_write(&mut self, txn: TransactionId, user: UserId, write: &RecordWrite) -> Result<()> {
        self.require_packet()?;
        if write.record_id.is_unassigned() {
            return Err(Error::StorageWrite(format!(
                "write to table {} has no record id",
                write.table
            )));
        }
        for value in write.values.values() {
            for r in value.refs() {
                known(r)?;
            }
        }

        let (table, record) = (write.table, write.record_id);
        let state = self.record_state(table, record)?;

        match write.kind {
            WriteKind::Create => {
                match state {
                    Some(false) => {
                        return Err(Error::StorageWrite(format!(
                            "record {} already exists in table {}",
                            record, table
                        )));
                    }
                    Some(true) => {
                        // Re-creating a deleted record starts from a clean slate.
                        self.clear_record_data(table, record)?;
                        self.conn.execute(
                            "UPDATE records SET deleted = 0, user_id = ?3, transaction_id = ?4
                             WHERE table_id = ?1 AND record_id = ?2",
                            params![table.as_raw(), record.as_raw(), user.as_raw(), txn.as_raw() as i64],
                        )?;
                    }
                    None => {
                        self.conn.execute(
                            "INSERT INTO records (table_id, record_id, user_id, transaction_id, deleted)
                             VALUES (?1, ?2, ?3, ?4, 0)",
                            params![table.as_raw(), record.as_raw(), user.as_raw(), txn.as_raw() as i64],
                        )?;
                    }
                }
                self.bump_sequence(table, record)?;
                self.write_values(write)
            }
            WriteKind::Update => {
                if state != Some(false) {
                    return Err(Error::StorageWrite(format!(
                        "cannot update missing record {} in table {}",
                        record, table
                    )));
                }
                self.conn.execute(
                    "UPDATE records SET user_id = ?3, transaction_id = ?4 WHERE table_id = ?1 AND record_id = ?2",
                    params![table.as_raw(), record.as_raw(), user.as_raw(), txn.as_raw() as i64],
                )?;
                self.write_values(write)
            }
            WriteKind::Delete => {
                if state != Some(false) {
                    return Err(Error::StorageWrite(format!(
                        "cannot delete missing record {} in table {}",
                        record, table
                    )));
                }
                self.clear_record_data(table, record)?;
                self.conn.execute(
                    "UPDATE records SET deleted = 1, user_id = ?3, transaction_id = ?4
                     WHERE table_id = ?1 AND record_id = ?2",
                    params![table.as_raw(), record.as_raw(), user.as_raw(), txn.as_raw() as i64],
                )?;
                Ok(())
            }
        }
    }

    fn last_committed_transaction_id(&self) -> Result<TransactionId> {
        let last: i64 = self.conn.query_row(
            "SELECT last_transaction_id FROM replica_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(TransactionId::from_raw(last as u64))
    }

    fn read_record(&self, table: TableId, record_id: RecordId) -> Result<Option<StoredRecord>> {
        let header = self
            .conn
            .query_row(
                "SELECT user_id, transaction_id, deleted FROM records WHERE table_id = ?1 AND record_id = ?2",
                params![table.as_raw(), record_id.as_raw()],
                |row| {
                    let user: u32 = row.get(0)?;
                    let txn: i64 = row.get(1)?;
                    let deleted: bool = row.get(2)?;
                    Ok((user, txn, deleted))
                },
            )
            .optional()?;

        let Some((user, txn, deleted)) = header else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT column_id, value FROM record_values WHERE table_id = ?1 AND record_id = ?2",
        )?;
        let rows = stmt.query_map(params![table.as_raw(), record_id.as_raw()], |row| {
            let column: u16 = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            Ok((column, value))
        })?;
        for row in rows {
            let (column, bytes) = row?;
            let value = decode_column_value(&bytes)
                .map_err(|e| Error::Schema(format!("corrupt stored value: {}", e)))?;
            values.insert(ColumnId::new(column), value);
        }

        let mut references: BTreeMap<ColumnId, Vec<RecordId>> = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT column_id, target_id FROM record_references
             WHERE table_id = ?1 AND record_id = ?2 ORDER BY column_id, target_id",
        )?;
        let rows = stmt.query_map(params![table.as_raw(), record_id.as_raw()], |row| {
            let column: u16 = row.get(0)?;
            let target: u32 = row.get(1)?;
            Ok((column, target))
        })?;
        for row in rows {
            let (column, target) = row?;
            references
                .entry(ColumnId::new(column))
                .or_default()
                .push(RecordId::new(target));
        }

        Ok(Some(StoredRecord {
            table,
            record_id,
            user_id: UserId::new(user),
            transaction_id: TransactionId::from_raw(txn as u64),
            deleted,
            values,
            references,
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
