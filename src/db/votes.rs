//! Vote persistence
//!
//! `voter_records` answers "has this account voted on this subject".
//! `value_records` answers "what is the net score of this subject".
//! Nothing here reads both tables in one statement.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{is_constraint_violation, LedgerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoterRecordRow {
    pub voter: String,
    pub subject: String,
    /// Day the vote was cast (YYYY-MM-DD)
    pub voted_on: String,
    /// Day the vote was indexed (YYYY-MM-DD)
    pub indexed_on: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueRecordRow {
    pub uri: String,
    pub value: i64,
    pub subject: String,
    pub created_at: String,
    pub indexed_at: String,
    pub indexed_by: String,
}

impl ValueRecordRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uri: row.get("uri")?,
            value: row.get("value")?,
            subject: row.get("subject")?,
            created_at: row.get("created_at")?,
            indexed_at: row.get("indexed_at")?,
            indexed_by: row.get("indexed_by")?,
        })
    }
}

/// Claim `(voter, subject)` before the vote is published.
///
/// The primary key makes this the double-vote check of record: a second claim
/// fails with `AlreadyVoted`, whichever process made the first one.
pub fn reserve_voter(conn: &Connection, voter: &VoterRecordRow) -> Result<(), LedgerError> {
    let inserted = conn.execute(
        "INSERT INTO voter_records (voter, subject, voted_on, indexed_on) VALUES (?, ?, ?, ?)",
        params![voter.voter, voter.subject, voter.voted_on, voter.indexed_on],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(LedgerError::AlreadyVoted(voter.subject.clone())),
        Err(e) => Err(LedgerError::Database(format!("Voter insert failed: {}", e))),
    }
}

/// Drop a claim whose vote never reached the ledger
pub fn release_voter(conn: &Connection, voter: &str, subject: &str) -> Result<bool, LedgerError> {
    let changes = conn
        .execute(
            "DELETE FROM voter_records WHERE voter = ? AND subject = ?",
            params![voter, subject],
        )
        .map_err(|e| LedgerError::Database(format!("Voter delete failed: {}", e)))?;
    Ok(changes > 0)
}

/// Insert a vote value, or overwrite value/subject/indexed fields if the URI exists
pub fn upsert_value_record(conn: &Connection, row: &ValueRecordRow) -> Result<(), LedgerError> {
    conn.execute(
        r#"
        INSERT INTO value_records (uri, value, subject, created_at, indexed_at, indexed_by)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            value = excluded.value,
            subject = excluded.subject,
            indexed_at = excluded.indexed_at,
            indexed_by = excluded.indexed_by
        "#,
        params![row.uri, row.value, row.subject, row.created_at, row.indexed_at, row.indexed_by],
    )
    .map_err(|e| LedgerError::Database(format!("Value upsert failed: {}", e)))?;
    Ok(())
}

/// Insert a vote value unless the URI is already present
pub fn insert_value_record_if_absent(conn: &Connection, row: &ValueRecordRow) -> Result<bool, LedgerError> {
    let changes = conn
        .execute(
            r#"
            INSERT INTO value_records (uri, value, subject, created_at, indexed_at, indexed_by)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
            params![row.uri, row.value, row.subject, row.created_at, row.indexed_at, row.indexed_by],
        )
        .map_err(|e| LedgerError::Database(format!("Value insert failed: {}", e)))?;
    Ok(changes > 0)
}

pub fn delete_value_record(conn: &Connection, uri: &str) -> Result<bool, LedgerError> {
    let changes = conn
        .execute("DELETE FROM value_records WHERE uri = ?", params![uri])
        .map_err(|e| LedgerError::Database(format!("Delete failed: {}", e)))?;
    Ok(changes > 0)
}

pub fn get_value_record(conn: &Connection, uri: &str) -> Result<Option<ValueRecordRow>, LedgerError> {
    conn.query_row(
        "SELECT uri, value, subject, created_at, indexed_at, indexed_by FROM value_records WHERE uri = ?",
        params![uri],
        |row| ValueRecordRow::from_row(row),
    )
    .optional()
    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

pub fn has_voted(conn: &Connection, voter: &str, subject: &str) -> Result<bool, LedgerError> {
    conn.query_row(
        "SELECT 1 FROM voter_records WHERE voter = ? AND subject = ?",
        params![voter, subject],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

/// Sum of vote values for a subject, 0 when there are none
pub fn score_of(conn: &Connection, subject: &str) -> Result<i64, LedgerError> {
    conn.query_row(
        "SELECT COALESCE(SUM(value), 0) FROM value_records WHERE subject = ?",
        params![subject],
        |row| row.get(0),
    )
    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

/// (subject, value) pairs for every vote on any of `subjects`
pub fn values_for_subjects(conn: &Connection, subjects: &[String]) -> Result<Vec<(String, i64)>, LedgerError> {
    if subjects.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<_> = subjects.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT subject, value FROM value_records WHERE subject IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| LedgerError::Database(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = subjects.iter().map(|s| s as &dyn rusqlite::ToSql).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LedgerError::Database(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}
