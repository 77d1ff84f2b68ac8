//! Live ledger stream
//!
//! - `transport` - raw websocket connection yielding text frames
//! - `client` - subscription, reconnect policy, feeding frames in order
//! - this module - decoding Jetstream events and applying them to the tables
//!
//! The materializer is the authority for the ledger's final state. Delivery is
//! at-least-once and may repeat, so every write is an upsert by primary key and
//! every delete tolerates a missing row.

pub mod client;
pub mod transport;

pub use client::{StreamClient, StreamClientConfig};

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use crate::checkpoint::CursorCheckpointStore;
use crate::db::{proposals, votes, LedgerDb, ProposalRow, ValueRecordRow};
use crate::error::LedgerError;
use crate::records::{at_uri, now_timestamp, Collection, ProposalRecord, VoteRecord};
use crate::validation::RecordValidator;

/// Provenance tag for rows written from the stream
pub const INDEXED_BY_STREAM: &str = "stream";

/// One Jetstream frame
#[derive(Debug, Clone, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    /// Cursor position (microseconds)
    pub time_us: i64,
    pub kind: EventKind,
    #[serde(default)]
    pub commit: Option<CommitData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitData {
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Upserted,
    Deleted,
    /// Not for us (other account, collection or event kind)
    Ignored,
    /// Failed decoding, validation or a storage constraint
    Dropped,
    /// Storage failed; the cursor was not advanced so the event is replayed
    Deferred,
}

pub struct StreamMaterializer {
    db: Arc<LedgerDb>,
    validator: Arc<dyn RecordValidator>,
    source_did: String,
    checkpoints: CursorCheckpointStore,
    last_seen: Option<i64>,
}

impl StreamMaterializer {
    pub fn new(
        db: Arc<LedgerDb>,
        validator: Arc<dyn RecordValidator>,
        source_did: impl Into<String>,
        checkpoints: CursorCheckpointStore,
    ) -> Self {
        Self {
            db,
            validator,
            source_did: source_did.into(),
            checkpoints,
            last_seen: None,
        }
    }

    /// Where a (re)subscription should start: the newest cursor seen in this
    /// process, else the newest persisted checkpoint.
    pub fn resume_cursor(&self) -> Option<i64> {
        self.last_seen.or(self.checkpoints.last_persisted())
    }

    /// Decode and apply one raw frame. Undecodable frames are dropped.
    pub fn handle_frame(&mut self, frame: &str) -> EventOutcome {
        match serde_json::from_str::<JetstreamEvent>(frame) {
            Ok(event) => self.handle_event(&event),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable stream frame");
                EventOutcome::Dropped
            }
        }
    }

    /// Apply one event, then record its cursor.
    ///
    /// A storage failure leaves the cursor where it was and returns
    /// `Deferred`; the caller resubscribes so the event arrives again.
    pub fn handle_event(&mut self, event: &JetstreamEvent) -> EventOutcome {
        let outcome = match self.apply(event) {
            Ok(outcome) => outcome,
            Err(e) if e.is_storage() => {
                error!(did = %event.did, cursor = event.time_us, error = %e, "Stream event not applied, holding cursor");
                return EventOutcome::Deferred;
            }
            Err(e) => {
                warn!(did = %event.did, cursor = event.time_us, error = %e, "Dropping stream event");
                EventOutcome::Dropped
            }
        };

        self.last_seen = Some(event.time_us);
        if let Err(e) = self.checkpoints.observe(event.time_us) {
            warn!(cursor = event.time_us, error = %e, "Failed to persist cursor checkpoint");
        }
        outcome
    }

    fn apply(&self, event: &JetstreamEvent) -> Result<EventOutcome, LedgerError> {
        if event.kind != EventKind::Commit || event.did != self.source_did {
            return Ok(EventOutcome::Ignored);
        }
        let Some(commit) = &event.commit else {
            return Ok(EventOutcome::Ignored);
        };
        let Some(collection) = Collection::from_nsid(&commit.collection) else {
            return Ok(EventOutcome::Ignored);
        };

        let uri = at_uri(&event.did, &commit.collection, &commit.rkey);
        trace!(uri = %uri, operation = ?commit.operation, "Applying stream event");

        match commit.operation {
            Operation::Delete => {
                let removed = if collection.is_proposal() {
                    self.db.with_conn(|conn| proposals::delete_proposal(conn, &commit.rkey))?
                } else {
                    self.db.with_conn(|conn| votes::delete_value_record(conn, &uri))?
                };
                debug!(uri = %uri, removed, "Applied delete");
                Ok(EventOutcome::Deleted)
            }
            Operation::Create | Operation::Update => {
                let record = commit
                    .record
                    .clone()
                    .ok_or_else(|| LedgerError::invalid_record(collection.nsid(), "commit carries no record"))?;

                if collection.is_proposal() {
                    self.upsert_proposal(collection, &commit.rkey, uri, record)
                } else {
                    self.upsert_vote(uri, record)
                }
            }
        }
    }

    fn upsert_proposal(
        &self,
        collection: Collection,
        rkey: &str,
        uri: String,
        record: serde_json::Value,
    ) -> Result<EventOutcome, LedgerError> {
        let record: ProposalRecord = serde_json::from_value(record)
            .map_err(|e| LedgerError::invalid_record(collection.nsid(), e.to_string()))?;
        self.validator.validate_proposal(collection, &record)?;
        let kind = record.kind(collection)?;

        let row = ProposalRow {
            rkey: rkey.to_string(),
            uri,
            creator: record.src,
            proposal_type: kind.proposal_type(),
            value: kind.value().to_string(),
            subject: kind.subject().to_string(),
            created_at: record.cts,
            indexed_at: now_timestamp(),
            indexed_by: INDEXED_BY_STREAM.to_string(),
        };

        match self.db.with_conn(|conn| proposals::upsert_proposal(conn, &row)) {
            Ok(()) => Ok(EventOutcome::Upserted),
            Err(LedgerError::AlreadyExists(existing)) => {
                warn!(uri = %row.uri, existing = %existing, "Duplicate proposal on stream, dropping");
                Ok(EventOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    fn upsert_vote(&self, uri: String, record: serde_json::Value) -> Result<EventOutcome, LedgerError> {
        let record: VoteRecord = serde_json::from_value(record)
            .map_err(|e| LedgerError::invalid_record(Collection::Vote.nsid(), e.to_string()))?;
        self.validator.validate_vote(&record)?;

        let row = ValueRecordRow {
            uri,
            value: record.val,
            subject: record.uri,
            created_at: record.cts,
            indexed_at: now_timestamp(),
            indexed_by: INDEXED_BY_STREAM.to_string(),
        };
        self.db.with_conn(|conn| votes::upsert_value_record(conn, &row))?;
        Ok(EventOutcome::Upserted)
    }
}
