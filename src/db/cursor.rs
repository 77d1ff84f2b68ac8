//! Cursor checkpoint log

use rusqlite::{params, Connection};

use crate::error::LedgerError;

pub fn insert_checkpoint(conn: &Connection, observed_at_ms: i64, cursor: i64) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO cursor_checkpoints (observed_at, cursor) VALUES (?, ?)",
        params![observed_at_ms, cursor],
    )
    .map_err(|e| LedgerError::Database(format!("Checkpoint insert failed: {}", e)))?;
    Ok(())
}

/// Delete checkpoints observed before `cutoff_ms`, returning how many went
pub fn prune_checkpoints(conn: &Connection, cutoff_ms: i64) -> Result<usize, LedgerError> {
    conn.execute(
        "DELETE FROM cursor_checkpoints WHERE observed_at < ?",
        params![cutoff_ms],
    )
    .map_err(|e| LedgerError::Database(format!("Checkpoint prune failed: {}", e)))
}

/// Highest persisted cursor
pub fn latest_cursor(conn: &Connection) -> Result<Option<i64>, LedgerError> {
    conn.query_row("SELECT MAX(cursor) FROM cursor_checkpoints", [], |row| row.get(0))
        .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}
