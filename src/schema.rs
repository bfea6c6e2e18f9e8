//! # SQLite Schema for ClusterDB
//!
//! Local storage of one replica. Every replica holds an identical copy once it
//! has applied the same prefix of the resolved log.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  replica_state             table_sequences                              │
//! │  ┌─────────────────────┐   ┌──────────────────┐                         │
//! │  │ last_transaction_id │   │ table_id (PK)    │                         │
//! │  └─────────────────────┘   │ next_record_id   │                         │
//! │                            └──────────────────┘                         │
//! │                                                                         │
//! │  records                   record_values          record_references     │
//! │  ┌──────────────────┐      ┌──────────────┐       ┌──────────────┐      │
//! │  │ table_id, rec_id │◄─────│ table, rec   │       │ table, rec   │      │
//! │  │ user_id          │      │ column_id    │       │ column_id    │      │
//! │  │ transaction_id   │      │ value BLOB   │       │ target_id    │      │
//! │  │ deleted          │      └──────────────┘       └──────────────┘      │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! `last_transaction_id` is updated in the same SQLite transaction as the
//! writes it covers, so the applied prefix and the data can never disagree
//! after a crash.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Key/value metadata, currently only `schema_version`.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS clusterdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Single-row table holding the last applied global transaction id.
const CREATE_REPLICA_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS replica_state (
    id                  INTEGER PRIMARY KEY CHECK (id = 1),
    last_transaction_id INTEGER NOT NULL
)
"#;

const SEED_REPLICA_STATE: &str =
    "INSERT OR IGNORE INTO replica_state (id, last_transaction_id) VALUES (1, 0)";

/// Next record id to hand out per table. Ids start at 1.
const CREATE_TABLE_SEQUENCES: &str = r#"
CREATE TABLE IF NOT EXISTS table_sequences (
    table_id       INTEGER PRIMARY KEY,
    next_record_id INTEGER NOT NULL
)
"#;

/// One row per record ever created.
///
/// # Columns
///
/// - `user_id`, `transaction_id`: who last wrote the record, and in which
///   global transaction
/// - `deleted`: soft-delete flag; a create with an explicit id clears it
const CREATE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    table_id       INTEGER NOT NULL,
    record_id      INTEGER NOT NULL,
    user_id        INTEGER NOT NULL,
    transaction_id INTEGER NOT NULL,
    deleted        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_id, record_id)
) WITHOUT ROWID
"#;

/// Scalar and single-reference column values, encoded with the packet codec.
const CREATE_RECORD_VALUES: &str = r#"
CREATE TABLE IF NOT EXISTS record_values (
    table_id  INTEGER NOT NULL,
    record_id INTEGER NOT NULL,
    column_id INTEGER NOT NULL,
    value     BLOB NOT NULL,
    PRIMARY KEY (table_id, record_id, column_id)
) WITHOUT ROWID
"#;

/// Members of multi-reference columns.
const CREATE_RECORD_REFERENCES: &str = r#"
CREATE TABLE IF NOT EXISTS record_references (
    table_id  INTEGER NOT NULL,
    record_id INTEGER NOT NULL,
    column_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    PRIMARY KEY (table_id, record_id, column_id, target_id)
) WITHOUT ROWID
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the ClusterDB schema applied.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers never block the single writer.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_REPLICA_STATE)?;
        self.conn.execute_batch(SEED_REPLICA_STATE)?;
        self.conn.execute_batch(CREATE_TABLE_SEQUENCES)?;
        self.conn.execute_batch(CREATE_RECORDS)?;
        self.conn.execute_batch(CREATE_RECORD_VALUES)?;
        self.conn.execute_batch(CREATE_RECORD_REFERENCES)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM clusterdb_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .ok();

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO clusterdb_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this ClusterDB version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
