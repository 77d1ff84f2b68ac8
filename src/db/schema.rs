//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(LedgerError::Database(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| LedgerError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| LedgerError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| LedgerError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(PROPOSALS_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create proposal tables: {}", e)))?;

    conn.execute_batch(VOTES_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create vote tables: {}", e)))?;

    conn.execute_batch(SYNC_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create sync tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| LedgerError::Database(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Proposals schema
const PROPOSALS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS proposals (
    rkey TEXT PRIMARY KEY NOT NULL,
    uri TEXT NOT NULL,
    creator TEXT NOT NULL,
    proposal_type TEXT NOT NULL,
    value TEXT NOT NULL,
    subject TEXT NOT NULL,
    created_at TEXT NOT NULL,
    indexed_at TEXT NOT NULL,
    -- stream | backfill | publish
    indexed_by TEXT NOT NULL,

    UNIQUE (proposal_type, value, subject)
);
"#;

/// Vote schema
///
/// The two relations share only `subject`. Voter timestamps are day-granular
/// and both tables are WITHOUT ROWID so insertion order cannot pair rows.
const VOTES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS voter_records (
    voter TEXT NOT NULL,
    subject TEXT NOT NULL,
    voted_on TEXT NOT NULL,
    indexed_on TEXT NOT NULL,
    PRIMARY KEY (voter, subject)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS value_records (
    uri TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL,
    subject TEXT NOT NULL,
    created_at TEXT NOT NULL,
    indexed_at TEXT NOT NULL,
    indexed_by TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Stream bookkeeping and caches
const SYNC_SCHEMA: &str = r#"
-- Append-only, pruned log of stream resume positions
CREATE TABLE IF NOT EXISTS cursor_checkpoints (
    observed_at INTEGER NOT NULL,
    cursor INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS embed_cache (
    subject TEXT PRIMARY KEY NOT NULL,
    html TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_proposals_uri ON proposals(uri);
CREATE INDEX IF NOT EXISTS idx_proposals_type_created ON proposals(proposal_type, created_at);

CREATE INDEX IF NOT EXISTS idx_value_records_subject ON value_records(subject);

CREATE INDEX IF NOT EXISTS idx_cursor_checkpoints_cursor ON cursor_checkpoints(cursor);
CREATE INDEX IF NOT EXISTS idx_cursor_checkpoints_observed ON cursor_checkpoints(observed_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn columns(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table)).unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<HashSet<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_vote_relations_share_only_subject() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let voters = columns(&conn, "voter_records");
        let values = columns(&conn, "value_records");
        let shared: Vec<_> = voters.intersection(&values).cloned().collect();
        assert_eq!(shared, vec!["subject".to_string()]);

        // Day-granular dates only, nothing finer to pair on
        let expected: HashSet<String> = ["voter", "subject", "voted_on", "indexed_on"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(voters, expected);

        assert!(!voters.contains("value"));
        assert!(!voters.contains("uri"));
        assert!(!values.contains("voter"));

        // No implicit rowid to pair rows by insertion order
        assert!(conn.prepare("SELECT rowid FROM voter_records").is_err());
        assert!(conn.prepare("SELECT rowid FROM value_records").is_err());
    }
}
