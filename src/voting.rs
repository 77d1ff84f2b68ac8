//! Anonymous voting ledger and score aggregation
//!
//! A vote is stored as two facts that share only the subject: who voted
//! (`voter_records`) and what was voted (`value_records`). Scores are computed
//! from value rows alone; the double-vote check reads voter rows alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::db::{proposals, votes, LedgerDb, ValueRecordRow, VoterRecordRow};
use crate::error::LedgerError;
use crate::records::{ProposalType, ALLOWED_USER_MARKER};

pub struct VotingLedger {
    db: Arc<LedgerDb>,
    bootstrap_allowed: HashSet<String>,
}

impl VotingLedger {
    pub fn new(db: Arc<LedgerDb>, bootstrap_allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            db,
            bootstrap_allowed: bootstrap_allowed.into_iter().collect(),
        }
    }

    pub fn has_voted(&self, voter: &str, subject: &str) -> Result<bool, LedgerError> {
        self.db.with_conn(|conn| votes::has_voted(conn, voter, subject))
    }

    /// Net score for one subject, 0 when nobody has voted
    pub fn score_of(&self, subject: &str) -> Result<i64, LedgerError> {
        self.db.with_conn(|conn| votes::score_of(conn, subject))
    }

    /// Net score for every subject in `subjects`
    pub fn scores_of(&self, subjects: &[String]) -> Result<HashMap<String, i64>, LedgerError> {
        let values = self.db.with_conn(|conn| votes::values_for_subjects(conn, subjects))?;

        let mut scores: HashMap<String, i64> = subjects.iter().map(|s| (s.clone(), 0)).collect();
        for (subject, value) in values {
            if value != 1 && value != -1 {
                warn!(subject = %subject, value, "Vote value outside +/-1, counting it anyway");
            }
            *scores.entry(subject).or_insert(0) += value;
        }
        Ok(scores)
    }

    /// Whether `candidate` has been admitted: bootstrap members always are,
    /// anyone else needs an allow-user proposal with a positive score.
    pub fn whitelisted(&self, candidate: &str) -> Result<bool, LedgerError> {
        if self.bootstrap_allowed.contains(candidate) {
            return Ok(true);
        }

        self.db.with_conn(|conn| {
            let proposal = proposals::find_by_natural_key(
                conn,
                ProposalType::AllowedUser,
                ALLOWED_USER_MARKER,
                candidate,
            )?;
            match proposal {
                Some(p) => Ok(votes::score_of(conn, &p.uri)? > 0),
                None => Ok(false),
            }
        })
    }

    /// Take the `(voter, subject)` slot; `AlreadyVoted` if it is taken
    pub fn reserve(&self, voter: &VoterRecordRow) -> Result<(), LedgerError> {
        self.db.with_conn(|conn| votes::reserve_voter(conn, voter))
    }

    /// Give back a slot whose vote was never published
    pub fn release(&self, voter: &str, subject: &str) -> Result<(), LedgerError> {
        self.db.with_conn(|conn| votes::release_voter(conn, voter, subject)).map(|_| ())
    }

    /// Add the value half of a published vote
    pub fn record_value(&self, value: &ValueRecordRow) -> Result<(), LedgerError> {
        self.db.with_conn(|conn| votes::upsert_value_record(conn, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::proposals::upsert_proposal;
    use crate::db::votes::tests::value_row;
    use crate::db::votes::upsert_value_record;
    use crate::db::ProposalRow;

    fn allow_proposal(rkey: &str, candidate: &str) -> ProposalRow {
        ProposalRow {
            rkey: rkey.to_string(),
            uri: format!("at://did:plc:svc/social.pmsky.proposal/{}", rkey),
            creator: "did:plc:member".to_string(),
            proposal_type: ProposalType::AllowedUser,
            value: ALLOWED_USER_MARKER.to_string(),
            subject: candidate.to_string(),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            indexed_at: "2024-01-01T00:00:00.000Z".to_string(),
            indexed_by: "stream".to_string(),
        }
    }

    #[test]
    fn test_scores_default_to_zero() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        db.with_conn(|c| {
            upsert_value_record(c, &value_row("v1", 1, "A"))?;
            upsert_value_record(c, &value_row("v2", 1, "A"))?;
            upsert_value_record(c, &value_row("v3", -1, "A"))
        })
        .unwrap();

        let ledger = VotingLedger::new(db, Vec::new());
        let scores = ledger.scores_of(&["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(scores["A"], 1);
        assert_eq!(scores["B"], 0);
        assert_eq!(ledger.score_of("A").unwrap(), 1);
    }

    #[test]
    fn test_out_of_range_values_still_sum() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        db.with_conn(|c| {
            upsert_value_record(c, &value_row("v1", 3, "A"))?;
            upsert_value_record(c, &value_row("v2", -1, "A"))
        })
        .unwrap();

        let ledger = VotingLedger::new(db, Vec::new());
        assert_eq!(ledger.scores_of(&["A".to_string()]).unwrap()["A"], 2);
    }

    #[test]
    fn test_whitelisted_follows_proposal_score() {
        let db = Arc::new(LedgerDb::open_in_memory().unwrap());
        let proposal = allow_proposal("p1", "did:plc:cand");
        db.with_conn(|c| upsert_proposal(c, &proposal)).unwrap();

        let ledger = VotingLedger::new(db.clone(), vec!["did:plc:founder".to_string()]);
        assert!(ledger.whitelisted("did:plc:founder").unwrap());
        assert!(!ledger.whitelisted("did:plc:cand").unwrap());
        assert!(!ledger.whitelisted("did:plc:stranger").unwrap());

        db.with_conn(|c| upsert_value_record(c, &value_row("v1", 1, &proposal.uri))).unwrap();
        assert!(ledger.whitelisted("did:plc:cand").unwrap());

        db.with_conn(|c| upsert_value_record(c, &value_row("v2", -1, &proposal.uri))).unwrap();
        assert!(!ledger.whitelisted("did:plc:cand").unwrap());
    }
}
