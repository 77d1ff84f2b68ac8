//! Historical backfill
//!
//! Lists every record the service account holds in the watched collections
//! and inserts the ones the local tables are missing. Rows that already exist
//! are never touched: whatever the stream or a publish wrote is at least as
//! fresh as the listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{proposals, votes, LedgerDb, ProposalRow, ValueRecordRow};
use crate::error::LedgerError;
use crate::ledger::{LedgerClient, ListedRecord};
use crate::records::{now_timestamp, parse_at_uri, Collection, ProposalRecord, VoteRecord};
use crate::validation::RecordValidator;

/// Provenance tag for rows written by backfill
pub const INDEXED_BY_BACKFILL: &str = "backfill";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub listed: usize,
    pub inserted: usize,
    /// Already present locally
    pub skipped: usize,
    /// Failed decoding or validation
    pub invalid: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub collections: BTreeMap<String, CollectionReport>,
}

impl BackfillReport {
    pub fn inserted(&self) -> usize {
        self.collections.values().map(|c| c.inserted).sum()
    }
}

pub struct BackfillReconciler {
    db: Arc<LedgerDb>,
    ledger: Arc<dyn LedgerClient>,
    validator: Arc<dyn RecordValidator>,
    source_did: String,
}

enum Merge {
    Inserted,
    Skipped,
}

impl BackfillReconciler {
    pub fn new(
        db: Arc<LedgerDb>,
        ledger: Arc<dyn LedgerClient>,
        validator: Arc<dyn RecordValidator>,
        source_did: impl Into<String>,
    ) -> Self {
        Self {
            db,
            ledger,
            validator,
            source_did: source_did.into(),
        }
    }

    /// Run one reconciliation pass over every watched collection.
    ///
    /// A listing failure aborts the pass; individual bad records are counted
    /// and skipped.
    pub async fn run(&self) -> Result<BackfillReport, LedgerError> {
        info!(account = %self.source_did, "Starting backfill");
        let mut report = BackfillReport::default();

        for collection in Collection::WATCHED {
            let records = self.ledger.list_records(&self.source_did, collection.nsid()).await?;

            let mut counts = CollectionReport {
                listed: records.len(),
                ..Default::default()
            };
            for listed in &records {
                match self.merge(collection, listed) {
                    Ok(Merge::Inserted) => counts.inserted += 1,
                    Ok(Merge::Skipped) => counts.skipped += 1,
                    Err(e) => {
                        warn!(uri = %listed.uri, error = %e, "Skipping backfill record");
                        counts.invalid += 1;
                    }
                }
            }

            info!(
                collection = collection.nsid(),
                listed = counts.listed,
                inserted = counts.inserted,
                skipped = counts.skipped,
                invalid = counts.invalid,
                "Backfilled collection"
            );
            report.collections.insert(collection.nsid().to_string(), counts);
        }

        Ok(report)
    }

    fn merge(&self, collection: Collection, listed: &ListedRecord) -> Result<Merge, LedgerError> {
        let (_, _, rkey) = parse_at_uri(&listed.uri)
            .ok_or_else(|| LedgerError::invalid_record(collection.nsid(), format!("bad uri '{}'", listed.uri)))?;

        let inserted = if collection.is_proposal() {
            let record: ProposalRecord = serde_json::from_value(listed.value.clone())
                .map_err(|e| LedgerError::invalid_record(collection.nsid(), e.to_string()))?;
            self.validator.validate_proposal(collection, &record)?;
            let kind = record.kind(collection)?;

            let row = ProposalRow {
                rkey: rkey.to_string(),
                uri: listed.uri.clone(),
                creator: record.src,
                proposal_type: kind.proposal_type(),
                value: kind.value().to_string(),
                subject: kind.subject().to_string(),
                created_at: record.cts,
                indexed_at: now_timestamp(),
                indexed_by: INDEXED_BY_BACKFILL.to_string(),
            };
            self.db.with_conn(|conn| proposals::insert_proposal_if_absent(conn, &row))?
        } else {
            let record: VoteRecord = serde_json::from_value(listed.value.clone())
                .map_err(|e| LedgerError::invalid_record(collection.nsid(), e.to_string()))?;
            self.validator.validate_vote(&record)?;

            let row = ValueRecordRow {
                uri: listed.uri.clone(),
                value: record.val,
                subject: record.uri,
                created_at: record.cts,
                indexed_at: now_timestamp(),
                indexed_by: INDEXED_BY_BACKFILL.to_string(),
            };
            self.db.with_conn(|conn| votes::insert_value_record_if_absent(conn, &row))?
        };

        if inserted {
            debug!(uri = %listed.uri, "Backfilled record");
            Ok(Merge::Inserted)
        } else {
            Ok(Merge::Skipped)
        }
    }
}
