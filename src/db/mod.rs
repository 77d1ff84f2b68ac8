//! SQLite materialized view of the remote ledger
//!
//! ## Tables
//!
//! - `proposals` - Proposals keyed by rkey, unique on (type, value, subject)
//! - `voter_records` - Who voted on which subject (no value)
//! - `value_records` - Vote values keyed by vote URI (no voter)
//! - `cursor_checkpoints` - Recent stream resume positions
//! - `embed_cache` - Post preview HTML keyed by subject URI
//!
//! All functions in the submodules take a borrowed `Connection`; callers go
//! through [`LedgerDb::with_conn`] / [`LedgerDb::with_conn_mut`] so the lock is
//! held only for the duration of one synchronous operation.

pub mod cursor;
pub mod embeds;
pub mod proposals;
pub mod schema;
pub mod votes;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::LedgerError;

/// SQLite database holding the materialized view
pub struct LedgerDb {
    conn: Mutex<Connection>,
}

impl LedgerDb {
    /// Open or create the database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, LedgerError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| LedgerError::Database(format!("Failed to open SQLite: {}", e)))?;

        // WAL lets readers proceed while the stream is writing
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LedgerError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        Self::with_schema(conn)
    }

    /// Open an in-memory database (for testing and offline mode)
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self, LedgerError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read (or single-statement write) against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LedgerError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| LedgerError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, LedgerError> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
            };

            Ok(DbStats {
                proposal_count: count("proposals")?,
                voter_record_count: count("voter_records")?,
                value_record_count: count("value_records")?,
                checkpoint_count: count("cursor_checkpoints")?,
                cached_embed_count: count("embed_cache")?,
                latest_cursor: cursor::latest_cursor(conn)?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub proposal_count: u64,
    pub voter_record_count: u64,
    pub value_record_count: u64,
    pub checkpoint_count: u64,
    pub cached_embed_count: u64,
    pub latest_cursor: Option<i64>,
}

// Re-exports
pub use proposals::ProposalRow;
pub use votes::{ValueRecordRow, VoterRecordRow};
