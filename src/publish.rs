//! Publishing proposals and votes
//!
//! Every write goes to the remote ledger first. Only after the ledger accepts
//! it is the record mirrored into the local tables, so the listing reflects it
//! before the stream delivers it back. A failed mirror is logged and left for
//! the stream to repair.
//!
//! Votes are the exception on the voter side: the `(voter, subject)` row is
//! inserted before the remote write and removed again if that write fails.
//! The stream never carries voter identity, so that row cannot be repaired
//! later and has to exist before the vote does.
//!
//! Publishes for the same proposal natural key, or the same (voter, subject)
//! pair, are serialized in-process through a claim set. The UNIQUE constraints
//! in the database cover everything the claim set cannot see.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::db::{proposals, LedgerDb, ProposalRow, ValueRecordRow, VoterRecordRow};
use crate::error::LedgerError;
use crate::ledger::LedgerClient;
use crate::records::{
    next_rkey, now_timestamp, Collection, ProposalKind, ProposalRecord, VoteRecord, PROPOSAL_COLLECTION,
    VOTE_COLLECTION,
};
use crate::validation::RecordValidator;
use crate::voting::VotingLedger;

/// Provenance tag for rows written by this module
pub const INDEXED_BY_PUBLISH: &str = "publish";

/// Held while a publish for `key` is in flight
struct Claim<'a> {
    claims: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // map + our guard; anything more is a waiter that still needs the entry
        self.claims.remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

pub struct PublishCoordinator {
    db: Arc<LedgerDb>,
    ledger: Arc<dyn LedgerClient>,
    validator: Arc<dyn RecordValidator>,
    voting: Arc<VotingLedger>,
    /// Repository every record is written to
    account: String,
    allowed_labels: HashSet<String>,
    claims: DashMap<String, Arc<Mutex<()>>>,
}

impl PublishCoordinator {
    pub fn new(
        db: Arc<LedgerDb>,
        ledger: Arc<dyn LedgerClient>,
        validator: Arc<dyn RecordValidator>,
        voting: Arc<VotingLedger>,
        account: impl Into<String>,
        allowed_labels: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            db,
            ledger,
            validator,
            voting,
            account: account.into(),
            allowed_labels: allowed_labels.into_iter().collect(),
            claims: DashMap::new(),
        }
    }

    async fn claim(&self, key: String) -> Claim<'_> {
        let lock = self
            .claims
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Claim {
            claims: &self.claims,
            key,
            _guard: guard,
        }
    }

    /// Publish a new proposal on behalf of `creator`, returning its URI.
    ///
    /// Fails with `AlreadyExists` (carrying the existing URI) when a proposal
    /// with the same type, value and subject is already known.
    pub async fn publish_proposal(&self, kind: ProposalKind, creator: &str) -> Result<String, LedgerError> {
        let proposal_type = kind.proposal_type();
        let _claim = self
            .claim(format!("proposal\0{}\0{}\0{}", proposal_type, kind.value(), kind.subject()))
            .await;

        let existing = self
            .db
            .with_conn(|conn| proposals::find_by_natural_key(conn, proposal_type, kind.value(), kind.subject()))?;
        if let Some(existing) = existing {
            debug!(uri = %existing.uri, "Proposal already exists");
            return Err(LedgerError::AlreadyExists(existing.uri));
        }

        if let ProposalKind::Label { value, .. } = &kind {
            if !self.allowed_labels.contains(value) {
                return Err(LedgerError::invalid_record(
                    PROPOSAL_COLLECTION,
                    format!("label '{}' is not allowed", value),
                ));
            }
        }

        let record = ProposalRecord::new(&kind, creator, now_timestamp());
        self.validator.validate_proposal(Collection::Proposal, &record)?;

        let rkey = next_rkey();
        let uri = self
            .ledger
            .put_record(&self.account, PROPOSAL_COLLECTION, &rkey, serde_json::to_value(&record)?)
            .await?;
        info!(uri = %uri, proposal_type = %proposal_type, "Published proposal");

        let row = ProposalRow {
            rkey,
            uri: uri.clone(),
            creator: creator.to_string(),
            proposal_type,
            value: kind.value().to_string(),
            subject: kind.subject().to_string(),
            created_at: record.cts.clone(),
            indexed_at: now_timestamp(),
            indexed_by: INDEXED_BY_PUBLISH.to_string(),
        };
        match self.db.with_conn(|conn| proposals::upsert_proposal(conn, &row)) {
            Ok(()) => {}
            Err(LedgerError::AlreadyExists(winner)) if winner != uri => {
                warn!(uri = %uri, winner = %winner, "Lost natural-key race while mirroring proposal");
                return Err(LedgerError::AlreadyExists(winner));
            }
            Err(e) => {
                let e = LedgerError::LocalMirror(e.to_string());
                warn!(uri = %uri, error = %e, "Proposal left for the stream to materialize");
            }
        }

        Ok(uri)
    }

    /// Publish `voter`'s vote of `value` on the proposal at `subject`,
    /// returning the vote record's URI.
    pub async fn publish_vote(&self, value: i64, subject: &str, voter: &str) -> Result<String, LedgerError> {
        let _claim = self.claim(format!("vote\0{}\0{}", voter, subject)).await;

        if self.db.with_conn(|conn| proposals::get_by_uri(conn, subject))?.is_none() {
            return Err(LedgerError::NotFound(subject.to_string()));
        }
        if self.voting.has_voted(voter, subject)? {
            return Err(LedgerError::AlreadyVoted(subject.to_string()));
        }
        if value != 1 && value != -1 {
            return Err(LedgerError::InvalidVote(value));
        }

        // The ledger record names the service account, never the voter
        let record = VoteRecord::new(&self.account, subject, value, now_timestamp());
        self.validator.validate_vote(&record)?;
        let body = serde_json::to_value(&record)?;

        // Taken before the remote write, given back if that write fails
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let voter_row = VoterRecordRow {
            voter: voter.to_string(),
            subject: subject.to_string(),
            voted_on: today.clone(),
            indexed_on: today,
        };
        if let Err(e) = self.voting.reserve(&voter_row) {
            if let LedgerError::AlreadyVoted(_) = e {
                debug!(subject = %subject, "Voter slot taken by a concurrent publish");
            }
            return Err(e);
        }

        let rkey = next_rkey();
        let uri = match self.ledger.put_record(&self.account, VOTE_COLLECTION, &rkey, body).await {
            Ok(uri) => uri,
            Err(e) => {
                if let Err(release) = self.voting.release(voter, subject) {
                    error!(subject = %subject, error = %release, "Failed to release voter slot after remote failure");
                }
                return Err(e);
            }
        };
        info!(uri = %uri, "Published vote");

        let value_row = ValueRecordRow {
            uri: uri.clone(),
            value,
            subject: subject.to_string(),
            created_at: record.cts.clone(),
            indexed_at: now_timestamp(),
            indexed_by: INDEXED_BY_PUBLISH.to_string(),
        };
        // The voter slot stays taken either way; the stream brings the value
        if let Err(e) = self.voting.record_value(&value_row) {
            let e = LedgerError::LocalMirror(e.to_string());
            warn!(uri = %uri, error = %e, "Vote value left for the stream to materialize");
        }

        Ok(uri)
    }
}
