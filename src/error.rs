//! Error types for moderation-ledger

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid record for type {collection}: {reason}")]
    InvalidRecord { collection: String, reason: String },

    #[error("Proposal already exists: {0}")]
    AlreadyExists(String),

    #[error("Already voted on: {0}")]
    AlreadyVoted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid vote value, expected +/- 1: {0}")]
    InvalidVote(i64),

    #[error("Remote write failed: {0}")]
    RemoteWrite(String),

    #[error("Local mirror failed: {0}")]
    LocalMirror(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn invalid_record(collection: &str, reason: impl Into<String>) -> Self {
        LedgerError::InvalidRecord {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }

    /// Idempotency guards: the caller should redirect to the existing
    /// resource instead of treating these as failures.
    pub fn is_redirect(&self) -> bool {
        matches!(self, LedgerError::AlreadyExists(_) | LedgerError::AlreadyVoted(_))
    }

    /// Local storage failed; retrying the same input may succeed
    pub fn is_storage(&self) -> bool {
        matches!(self, LedgerError::Database(_) | LedgerError::Internal(_) | LedgerError::Io(_))
    }
}

/// True when a rusqlite error is a UNIQUE/PRIMARY KEY violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
