//! Proposal persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{is_constraint_violation, LedgerError};
use crate::records::{ProposalKind, ProposalType};

/// Proposal row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalRow {
    pub rkey: String,
    pub uri: String,
    pub creator: String,
    pub proposal_type: ProposalType,
    pub value: String,
    pub subject: String,
    pub created_at: String,
    pub indexed_at: String,
    pub indexed_by: String,
}

impl ProposalRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let type_str: String = row.get("proposal_type")?;
        let proposal_type = ProposalType::parse(&type_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown proposal type '{}'", type_str).into(),
            )
        })?;

        Ok(Self {
            rkey: row.get("rkey")?,
            uri: row.get("uri")?,
            creator: row.get("creator")?,
            proposal_type,
            value: row.get("value")?,
            subject: row.get("subject")?,
            created_at: row.get("created_at")?,
            indexed_at: row.get("indexed_at")?,
            indexed_by: row.get("indexed_by")?,
        })
    }

    pub fn kind(&self) -> ProposalKind {
        ProposalKind::from_parts(self.proposal_type, &self.value, &self.subject)
    }
}

const SELECT_PROPOSAL: &str = "SELECT rkey, uri, creator, proposal_type, value, subject, \
     created_at, indexed_at, indexed_by FROM proposals";

/// Insert, or overwrite the mutable fields of an existing row with the same rkey.
///
/// A natural-key collision with a different rkey yields `AlreadyExists` carrying
/// the URI of the row that holds the key.
pub fn upsert_proposal(conn: &Connection, row: &ProposalRow) -> Result<(), LedgerError> {
    let result = conn.execute(
        r#"
        INSERT INTO proposals (
            rkey, uri, creator, proposal_type, value, subject,
            created_at, indexed_at, indexed_by
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(rkey) DO UPDATE SET
            value = excluded.value,
            subject = excluded.subject,
            indexed_at = excluded.indexed_at,
            indexed_by = excluded.indexed_by
        "#,
        params![
            row.rkey,
            row.uri,
            row.creator,
            row.proposal_type.as_str(),
            row.value,
            row.subject,
            row.created_at,
            row.indexed_at,
            row.indexed_by,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            let existing = find_by_natural_key(conn, row.proposal_type, &row.value, &row.subject)?;
            match existing {
                Some(existing) => Err(LedgerError::AlreadyExists(existing.uri)),
                // Deterministic: replaying the same row fails the same way
                None => Err(LedgerError::invalid_record("proposals", format!("constraint violation: {}", e))),
            }
        }
        Err(e) => Err(LedgerError::Database(format!("Upsert failed: {}", e))),
    }
}

/// Insert unless any row already holds the rkey, URI or natural key.
/// Returns true when a row was inserted.
pub fn insert_proposal_if_absent(conn: &Connection, row: &ProposalRow) -> Result<bool, LedgerError> {
    let changes = conn
        .execute(
            r#"
            INSERT INTO proposals (
                rkey, uri, creator, proposal_type, value, subject,
                created_at, indexed_at, indexed_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
            params![
                row.rkey,
                row.uri,
                row.creator,
                row.proposal_type.as_str(),
                row.value,
                row.subject,
                row.created_at,
                row.indexed_at,
                row.indexed_by,
            ],
        )
        .map_err(|e| LedgerError::Database(format!("Insert failed: {}", e)))?;

    Ok(changes > 0)
}

/// Delete proposal by rkey. Missing rows are not an error.
pub fn delete_proposal(conn: &Connection, rkey: &str) -> Result<bool, LedgerError> {
    let changes = conn
        .execute("DELETE FROM proposals WHERE rkey = ?", params![rkey])
        .map_err(|e| LedgerError::Database(format!("Delete failed: {}", e)))?;

    Ok(changes > 0)
}

fn query_one(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Option<ProposalRow>, LedgerError> {
    conn.query_row(sql, params, |row| ProposalRow::from_row(row))
        .optional()
        .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

pub fn get_by_rkey(conn: &Connection, rkey: &str) -> Result<Option<ProposalRow>, LedgerError> {
    query_one(conn, &format!("{} WHERE rkey = ?", SELECT_PROPOSAL), params![rkey])
}

pub fn get_by_uri(conn: &Connection, uri: &str) -> Result<Option<ProposalRow>, LedgerError> {
    query_one(conn, &format!("{} WHERE uri = ?", SELECT_PROPOSAL), params![uri])
}

pub fn find_by_natural_key(
    conn: &Connection,
    proposal_type: ProposalType,
    value: &str,
    subject: &str,
) -> Result<Option<ProposalRow>, LedgerError> {
    query_one(
        conn,
        &format!("{} WHERE proposal_type = ? AND value = ? AND subject = ?", SELECT_PROPOSAL),
        params![proposal_type.as_str(), value, subject],
    )
}

/// Newest-first page of proposals of one type
pub fn list_page(
    conn: &Connection,
    proposal_type: ProposalType,
    limit: u64,
    offset: u64,
) -> Result<Vec<ProposalRow>, LedgerError> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE proposal_type = ? ORDER BY created_at DESC, rkey DESC LIMIT ? OFFSET ?",
            SELECT_PROPOSAL
        ))
        .map_err(|e| LedgerError::Database(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(
            params![proposal_type.as_str(), limit as i64, offset as i64],
            |row| ProposalRow::from_row(row),
        )
        .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LedgerError::Database(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

pub fn count_by_type(conn: &Connection, proposal_type: ProposalType) -> Result<u64, LedgerError> {
    conn.query_row(
        "SELECT COUNT(*) FROM proposals WHERE proposal_type = ?",
        params![proposal_type.as_str()],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(|e| LedgerError::Database(format!("Query failed: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::LedgerDb;

    pub(crate) fn label_row(rkey: &str, value: &str, subject: &str, created_at: &str) -> ProposalRow {
        ProposalRow {
            rkey: rkey.to_string(),
            uri: format!("at://did:plc:svc/social.pmsky.proposal/{}", rkey),
            creator: "did:plc:svc".to_string(),
            proposal_type: ProposalType::Label,
            value: value.to_string(),
            subject: subject.to_string(),
            created_at: created_at.to_string(),
            indexed_at: created_at.to_string(),
            indexed_by: "stream".to_string(),
        }
    }

    #[test]
    fn test_upsert_overwrites_only_mutable_fields() {
        let db = LedgerDb::open_in_memory().unwrap();
        let original = label_row("r1", "helpful", "at://post/1", "2024-01-01T00:00:00.000Z");
        db.with_conn(|c| upsert_proposal(c, &original)).unwrap();

        let mut update = original.clone();
        update.value = "banger".into();
        update.creator = "did:plc:other".into();
        update.created_at = "2030-01-01T00:00:00.000Z".into();
        update.indexed_at = "2024-02-01T00:00:00.000Z".into();
        db.with_conn(|c| upsert_proposal(c, &update)).unwrap();

        let stored = db.with_conn(|c| get_by_rkey(c, "r1")).unwrap().unwrap();
        assert_eq!(stored.value, "banger");
        assert_eq!(stored.indexed_at, "2024-02-01T00:00:00.000Z");
        assert_eq!(stored.created_at, original.created_at);
        assert_eq!(stored.creator, original.creator);
    }

    #[test]
    fn test_natural_key_collision_reports_existing() {
        let db = LedgerDb::open_in_memory().unwrap();
        let first = label_row("r1", "helpful", "at://post/1", "2024-01-01T00:00:00.000Z");
        let second = label_row("r2", "helpful", "at://post/1", "2024-01-02T00:00:00.000Z");
        db.with_conn(|c| upsert_proposal(c, &first)).unwrap();

        match db.with_conn(|c| upsert_proposal(c, &second)) {
            Err(LedgerError::AlreadyExists(uri)) => assert_eq!(uri, first.uri),
            other => panic!("expected AlreadyExists, got {:?}", other),
        }

        assert!(!db.with_conn(|c| insert_proposal_if_absent(c, &second)).unwrap());
        assert!(db.with_conn(|c| get_by_rkey(c, "r2")).unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let db = LedgerDb::open_in_memory().unwrap();
        assert!(!db.with_conn(|c| delete_proposal(c, "nope")).unwrap());
    }

    #[test]
    fn test_list_page_newest_first() {
        let db = LedgerDb::open_in_memory().unwrap();
        db.with_conn(|c| {
            upsert_proposal(c, &label_row("a", "helpful", "at://post/1", "2024-01-01T00:00:00.000Z"))?;
            upsert_proposal(c, &label_row("b", "helpful", "at://post/2", "2024-01-03T00:00:00.000Z"))?;
            upsert_proposal(c, &label_row("c", "helpful", "at://post/3", "2024-01-02T00:00:00.000Z"))
        })
        .unwrap();

        let page = db.with_conn(|c| list_page(c, ProposalType::Label, 2, 0)).unwrap();
        let rkeys: Vec<_> = page.iter().map(|p| p.rkey.as_str()).collect();
        assert_eq!(rkeys, vec!["b", "c"]);

        let empty = db.with_conn(|c| list_page(c, ProposalType::AllowedUser, 2, 0)).unwrap();
        assert!(empty.is_empty());

        assert_eq!(db.with_conn(|c| count_by_type(c, ProposalType::Label)).unwrap(), 3);
        assert_eq!(db.with_conn(|c| count_by_type(c, ProposalType::AllowedUser)).unwrap(), 0);
    }
}
