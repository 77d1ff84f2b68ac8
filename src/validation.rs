//! Record validation
//!
//! Every decoded record passes through a [`RecordValidator`] before it is
//! accepted, whether it arrives from the stream, from backfill, or is about to
//! be published. Signature verification is out of scope; this is schema shape.

use chrono::DateTime;

use crate::error::LedgerError;
use crate::records::{Collection, ProposalRecord, ProposalType, VoteRecord, ALLOWED_USER_MARKER};

const MAX_VALUE_LEN: usize = 128;
const MAX_NOTE_LEN: usize = 3000;
const MAX_REASON_LEN: usize = 256;

/// Schema validation seam
pub trait RecordValidator: Send + Sync {
    fn validate_proposal(&self, collection: Collection, record: &ProposalRecord) -> Result<(), LedgerError>;

    fn validate_vote(&self, record: &VoteRecord) -> Result<(), LedgerError>;
}

/// Structural checks mirroring the `social.pmsky` lexicons
#[derive(Debug, Clone, Default)]
pub struct LexiconValidator;

impl LexiconValidator {
    pub fn new() -> Self {
        Self
    }
}

impl RecordValidator for LexiconValidator {
    fn validate_proposal(&self, collection: Collection, record: &ProposalRecord) -> Result<(), LedgerError> {
        let nsid = collection.nsid();
        if !collection.is_proposal() {
            return Err(LedgerError::invalid_record(nsid, "not a proposal collection"));
        }
        check_type(nsid, &record.record_type)?;
        check_did(nsid, "src", &record.src)?;
        check_non_empty(nsid, "uri", &record.uri)?;
        check_non_empty(nsid, "val", &record.val)?;
        if record.val.chars().count() > MAX_VALUE_LEN {
            return Err(LedgerError::invalid_record(nsid, "val too long"));
        }
        if record.proposal_type(collection)? == ProposalType::AllowedUser && record.val != ALLOWED_USER_MARKER {
            return Err(LedgerError::invalid_record(nsid, "allowed_user proposals must carry the allowed_user value"));
        }
        if record.note.as_ref().is_some_and(|n| n.chars().count() > MAX_NOTE_LEN) {
            return Err(LedgerError::invalid_record(nsid, "note too long"));
        }
        check_reasons(nsid, &record.reasons)?;
        check_datetime(nsid, &record.cts)
    }

    fn validate_vote(&self, record: &VoteRecord) -> Result<(), LedgerError> {
        let nsid = Collection::Vote.nsid();
        check_type(nsid, &record.record_type)?;
        check_did(nsid, "src", &record.src)?;
        if !record.uri.starts_with("at://") {
            return Err(LedgerError::invalid_record(nsid, "uri must be an at:// URI"));
        }
        check_reasons(nsid, &record.reasons)?;
        check_datetime(nsid, &record.cts)
    }
}

fn check_type(nsid: &str, record_type: &str) -> Result<(), LedgerError> {
    let bare = record_type.strip_suffix("#main").unwrap_or(record_type);
    if bare != nsid {
        return Err(LedgerError::invalid_record(nsid, format!("unexpected $type '{}'", record_type)));
    }
    Ok(())
}

fn check_did(nsid: &str, field: &str, value: &str) -> Result<(), LedgerError> {
    if !value.starts_with("did:") || value.len() <= 4 {
        return Err(LedgerError::invalid_record(nsid, format!("{} must be a DID", field)));
    }
    Ok(())
}

fn check_non_empty(nsid: &str, field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::invalid_record(nsid, format!("{} is empty", field)));
    }
    Ok(())
}

fn check_reasons(nsid: &str, reasons: &[String]) -> Result<(), LedgerError> {
    if reasons.iter().any(|r| r.is_empty() || r.chars().count() > MAX_REASON_LEN) {
        return Err(LedgerError::invalid_record(nsid, "invalid reason"));
    }
    Ok(())
}

fn check_datetime(nsid: &str, value: &str) -> Result<(), LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|e| LedgerError::invalid_record(nsid, format!("cts is not a datetime: {}", e)))
}
