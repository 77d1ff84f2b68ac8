//! Integration tests for publishing proposals and votes
//!
//! These run the engine against a mock ledger, so every remote write is
//! observable and can be made to fail.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use moderation_ledger::proposals::Decoration;
use moderation_ledger::records::{VOTE_COLLECTION, PROPOSAL_COLLECTION};
use moderation_ledger::{
    CursorCheckpointStore, LedgerDb, LedgerError, LexiconValidator, ProposalKind, ProposalType, StreamMaterializer,
};

#[tokio::test]
async fn test_publish_proposal_mirrors_locally() {
    let h = harness();

    let uri = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    let writes = h.ledger.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].collection, PROPOSAL_COLLECTION);
    assert_eq!(writes[0].uri, uri);
    assert_eq!(writes[0].record["src"], "did:plc:alice");
    assert_eq!(writes[0].record["typ"], "label");

    let listed = h.engine.get(&uri, None).await.unwrap().unwrap();
    assert_eq!(listed.creator, "did:plc:alice");
    assert_eq!(listed.kind, ProposalKind::label("helpful", post(1)));
    assert_eq!(listed.score, 0);
}

#[tokio::test]
async fn test_duplicate_proposal_redirects_to_existing() {
    let h = harness();
    let kind = ProposalKind::label("helpful", post(1));

    let first = h.engine.publish_proposal(kind.clone(), "did:plc:alice").await.unwrap();
    let second = h.engine.publish_proposal(kind, "did:plc:bob").await;

    match second {
        Err(e @ LedgerError::AlreadyExists(_)) => {
            assert!(e.is_redirect());
            assert!(matches!(e, LedgerError::AlreadyExists(ref uri) if *uri == first));
        }
        other => panic!("expected AlreadyExists, got {:?}", other),
    }
    assert_eq!(h.ledger.writes().len(), 1);
    assert_eq!(h.engine.stats().unwrap().proposal_count, 1);

    // Same subject, different label is a different proposal
    h.engine
        .publish_proposal(ProposalKind::label("banger", post(1)), "did:plc:bob")
        .await
        .unwrap();
    assert_eq!(h.engine.stats().unwrap().proposal_count, 2);
}

#[tokio::test]
async fn test_invalid_proposals_never_reach_the_ledger() {
    let h = harness();

    let unknown_label = h
        .engine
        .publish_proposal(ProposalKind::label("spam", post(1)), "did:plc:alice")
        .await;
    assert!(matches!(unknown_label, Err(LedgerError::InvalidRecord { .. })));

    let bad_creator = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "alice")
        .await;
    assert!(matches!(bad_creator, Err(LedgerError::InvalidRecord { .. })));

    assert!(h.ledger.writes().is_empty());
    assert_eq!(h.engine.stats().unwrap().proposal_count, 0);
}

#[tokio::test]
async fn test_remote_failure_leaves_no_local_rows() {
    let h = harness();
    let proposal = h
        .engine
        .publish_proposal(ProposalKind::allowed_user("did:plc:carol"), "did:plc:alice")
        .await
        .unwrap();

    h.ledger.fail_writes(true);

    let result = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(2)), "did:plc:alice")
        .await;
    assert!(matches!(result, Err(LedgerError::RemoteWrite(_))));

    let vote = h.engine.publish_vote(1, &proposal, "did:plc:alice").await;
    assert!(matches!(vote, Err(LedgerError::RemoteWrite(_))));

    let stats = h.engine.stats().unwrap();
    assert_eq!(stats.proposal_count, 1);
    assert_eq!(stats.voter_record_count, 0);
    assert_eq!(stats.value_record_count, 0);
    assert!(!h.engine.has_voted("did:plc:alice", &proposal).unwrap());

    // Nothing was claimed by the failed attempt
    h.ledger.fail_writes(false);
    h.engine.publish_vote(1, &proposal, "did:plc:alice").await.unwrap();
}

#[tokio::test]
async fn test_double_vote_is_rejected() {
    let h = harness();
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    h.engine.publish_vote(1, &subject, "did:plc:bob").await.unwrap();
    let again = h.engine.publish_vote(-1, &subject, "did:plc:bob").await;

    assert!(matches!(again, Err(LedgerError::AlreadyVoted(ref s)) if *s == subject));
    assert_eq!(h.engine.score_of(&subject).unwrap(), 1);
    assert_eq!(
        h.ledger.writes().iter().filter(|w| w.collection == VOTE_COLLECTION).count(),
        1
    );
}

#[tokio::test]
async fn test_vote_checks_run_in_order() {
    let h = harness();
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    let missing = h.engine.publish_vote(5, "at://did:plc:service/social.pmsky.proposal/nope", "did:plc:bob").await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    let invalid = h.engine.publish_vote(2, &subject, "did:plc:bob").await;
    assert!(matches!(invalid, Err(LedgerError::InvalidVote(2))));

    h.engine.publish_vote(-1, &subject, "did:plc:bob").await.unwrap();
    let voted_and_invalid = h.engine.publish_vote(0, &subject, "did:plc:bob").await;
    assert!(matches!(voted_and_invalid, Err(LedgerError::AlreadyVoted(_))));
}

#[tokio::test]
async fn test_vote_record_does_not_name_the_voter() {
    let h = harness();
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    h.engine.publish_vote(1, &subject, "did:plc:bob").await.unwrap();

    let vote = h
        .ledger
        .writes()
        .into_iter()
        .find(|w| w.collection == VOTE_COLLECTION)
        .unwrap();
    assert_eq!(vote.record["src"], SVC);
    assert_eq!(vote.record["uri"], subject.as_str());
    assert!(!vote.record.to_string().contains("did:plc:bob"));

    let voted_on: String = h
        .db
        .with_conn(|c| {
            c.query_row("SELECT voted_on FROM voter_records", [], |row| row.get(0))
                .map_err(|e| LedgerError::Database(e.to_string()))
        })
        .unwrap();
    assert_eq!(voted_on.len(), "2024-12-22".len());
}

#[tokio::test]
async fn test_scores_aggregate_votes() {
    let h = harness();
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("banger", post(1)), "did:plc:alice")
        .await
        .unwrap();
    let untouched = h
        .engine
        .publish_proposal(ProposalKind::label("banger", post(2)), "did:plc:alice")
        .await
        .unwrap();

    h.engine.publish_vote(1, &subject, "did:plc:v1").await.unwrap();
    h.engine.publish_vote(1, &subject, "did:plc:v2").await.unwrap();
    h.engine.publish_vote(-1, &subject, "did:plc:v3").await.unwrap();

    assert_eq!(h.engine.score_of(&subject).unwrap(), 1);
    let scores = h.engine.scores_of(&[subject.clone(), untouched.clone()]).unwrap();
    assert_eq!(scores[&subject], 1);
    assert_eq!(scores[&untouched], 0);
}

#[tokio::test]
async fn test_mirror_failure_is_not_surfaced() {
    let h = harness();
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    h.db.with_conn(|conn| {
        conn.execute_batch("DROP TABLE value_records")
            .map_err(|e| LedgerError::Database(e.to_string()))
    })
    .unwrap();

    let uri = h.engine.publish_vote(1, &subject, "did:plc:bob").await.unwrap();
    assert!(uri.contains(VOTE_COLLECTION));
    assert_eq!(h.ledger.writes().len(), 2);

    // The voter slot was taken before the write and survives the failed mirror
    assert!(h.engine.has_voted("did:plc:bob", &subject).unwrap());
    let again = h.engine.publish_vote(1, &subject, "did:plc:bob").await;
    assert!(matches!(again, Err(LedgerError::AlreadyVoted(_))));
    assert_eq!(h.ledger.writes().len(), 2);
}

#[tokio::test]
async fn test_two_engines_on_one_database_publish_one_vote() {
    let db = Arc::new(LedgerDb::open_in_memory().unwrap());
    let ledger = Arc::new(MockLedger::default());
    let a = harness_with(db.clone(), ledger.clone());
    let b = harness_with(db.clone(), ledger.clone());

    let subject = a
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        a.engine.publish_vote(1, &subject, "did:plc:bob"),
        b.engine.publish_vote(1, &subject, "did:plc:bob"),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results.iter().filter(|r| matches!(r, Err(LedgerError::AlreadyVoted(_)))).count(),
        1
    );
    assert_eq!(
        ledger.writes().iter().filter(|w| w.collection == VOTE_COLLECTION).count(),
        1
    );

    // Echo every ledger write back through the stream
    let checkpoints = CursorCheckpointStore::open(db.clone(), 1_000_000, Duration::from_secs(10)).unwrap();
    let mut materializer = StreamMaterializer::new(db.clone(), Arc::new(LexiconValidator::new()), SVC, checkpoints);
    for (n, written) in ledger.writes().iter().enumerate() {
        let frame = commit_frame("create", &written.collection, &written.rkey, Some(&written.record), 100 + n as i64);
        materializer.handle_frame(&frame);
    }

    assert_eq!(a.engine.score_of(&subject).unwrap(), 1);
    assert_eq!(b.engine.score_of(&subject).unwrap(), 1);
    assert_eq!(db.stats().unwrap().voter_record_count, 1);
}

#[tokio::test]
async fn test_concurrent_votes_by_one_voter_record_once() {
    let h = Arc::new(harness());
    let subject = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let subject = subject.clone();
        tasks.push(tokio::spawn(async move {
            h.engine.publish_vote(1, &subject, "did:plc:bob").await
        }));
    }

    let mut ok = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::AlreadyVoted(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(h.engine.score_of(&subject).unwrap(), 1);
}

#[tokio::test]
async fn test_whitelisting() {
    let h = harness();

    assert!(h.engine.whitelisted(FOUNDER).unwrap());
    assert!(!h.engine.whitelisted("did:plc:carol").unwrap());

    let proposal = h
        .engine
        .publish_proposal(ProposalKind::allowed_user("did:plc:carol"), "did:plc:alice")
        .await
        .unwrap();
    assert!(!h.engine.whitelisted("did:plc:carol").unwrap());

    h.engine.publish_vote(1, &proposal, "did:plc:v1").await.unwrap();
    assert!(h.engine.whitelisted("did:plc:carol").unwrap());

    h.engine.publish_vote(-1, &proposal, "did:plc:v2").await.unwrap();
    assert!(!h.engine.whitelisted("did:plc:carol").unwrap());
}

#[tokio::test]
async fn test_listing_is_hydrated() {
    let h = harness();
    let label = h
        .engine
        .publish_proposal(ProposalKind::label("helpful", post(1)), "did:plc:alice")
        .await
        .unwrap();
    h.engine
        .publish_proposal(ProposalKind::allowed_user("did:plc:carol"), "did:plc:alice")
        .await
        .unwrap();
    h.engine.publish_vote(1, &label, "did:plc:bob").await.unwrap();

    let labels = h.engine.list(ProposalType::Label, 10, 0, Some("did:plc:bob")).await.unwrap();
    assert_eq!(labels.proposals.len(), 1);
    let first = &labels.proposals[0];
    assert_eq!(first.score, 1);
    assert!(first.already_voted);
    assert_eq!(
        first.decoration,
        Decoration::Label {
            embed: Some(format!("<blockquote>{}</blockquote>", post(1)))
        }
    );

    let anonymous = h.engine.list(ProposalType::Label, 10, 0, None).await.unwrap();
    assert!(!anonymous.proposals[0].already_voted);

    let users = h.engine.list(ProposalType::AllowedUser, 10, 0, Some("did:plc:bob")).await.unwrap();
    assert_eq!(users.proposals.len(), 1);
    assert_eq!(
        users.proposals[0].decoration,
        Decoration::AllowedUser {
            handle: Some("carol.test".to_string())
        }
    );
    assert!(!users.proposals[0].already_voted);
}

#[tokio::test]
async fn test_paging_falls_back_to_last_page() {
    let h = harness();
    let mut uris = Vec::new();
    for n in 0..4 {
        uris.push(
            h.engine
                .publish_proposal(ProposalKind::label("helpful", post(n)), "did:plc:alice")
                .await
                .unwrap(),
        );
    }
    // newest first
    uris.reverse();

    let page0 = h.engine.list(ProposalType::Label, 2, 0, None).await.unwrap();
    assert!(page0.has_next);
    assert_eq!(page0.proposals.iter().map(|p| p.uri.clone()).collect::<Vec<_>>(), uris[..2].to_vec());

    let page1 = h.engine.list(ProposalType::Label, 2, 1, None).await.unwrap();
    assert!(!page1.has_next);
    assert_eq!(page1.page, 1);

    let beyond = h.engine.list(ProposalType::Label, 2, 2, None).await.unwrap();
    assert_eq!(beyond.page, 1);
    assert!(!beyond.has_next);
    assert_eq!(
        beyond.proposals.iter().map(|p| p.uri.clone()).collect::<Vec<_>>(),
        page1.proposals.iter().map(|p| p.uri.clone()).collect::<Vec<_>>()
    );

    let empty = h.engine.list(ProposalType::AllowedUser, 2, 3, None).await.unwrap();
    assert!(empty.proposals.is_empty());
    assert_eq!(empty.page, 0);
    assert!(!empty.has_next);
}

#[tokio::test]
async fn test_extreme_paging_arguments_are_clamped() {
    let h = harness();
    for n in 0..3 {
        h.engine
            .publish_proposal(ProposalKind::label("helpful", post(n)), "did:plc:alice")
            .await
            .unwrap();
    }

    let everything = h.engine.list(ProposalType::Label, u32::MAX, 0, None).await.unwrap();
    assert_eq!(everything.proposals.len(), 3);
    assert_eq!(everything.page, 0);
    assert!(!everything.has_next);

    let far = h.engine.list(ProposalType::Label, u32::MAX, u32::MAX, None).await.unwrap();
    assert_eq!(far.page, 0);
    assert_eq!(far.proposals.len(), 3);

    let last = h.engine.list(ProposalType::Label, 2, u32::MAX, None).await.unwrap();
    assert_eq!(last.page, 1);
    assert_eq!(last.proposals.len(), 1);
    assert!(!last.has_next);
}
