//! Embed cache persistence

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::LedgerError;

pub fn get_embed(conn: &Connection, subject: &str) -> Result<Option<String>, LedgerError> {
    conn.query_row(
        "SELECT html FROM embed_cache WHERE subject = ?",
        params![subject],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

pub fn put_embed(conn: &Connection, subject: &str, html: &str, fetched_at: &str) -> Result<(), LedgerError> {
    conn.execute(
        r#"
        INSERT INTO embed_cache (subject, html, fetched_at) VALUES (?, ?, ?)
        ON CONFLICT(subject) DO UPDATE SET html = excluded.html, fetched_at = excluded.fetched_at
        "#,
        params![subject, html, fetched_at],
    )
    .map_err(|e| LedgerError::Database(format!("Embed insert failed: {}", e)))?;
    Ok(())
}
