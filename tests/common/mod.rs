//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use moderation_ledger::records::at_uri;
use moderation_ledger::{
    Collaborators, Config, EmbedFetcher, Engine, HandleResolver, LedgerClient, LedgerDb, LedgerError,
    LexiconValidator, ListedRecord,
};

pub const SVC: &str = "did:plc:service";
pub const FOUNDER: &str = "did:plc:founder";

/// A record written through the mock ledger
#[derive(Debug, Clone)]
pub struct Written {
    pub collection: String,
    pub rkey: String,
    pub uri: String,
    pub record: serde_json::Value,
}

#[derive(Default)]
pub struct MockLedger {
    pub fail_writes: AtomicBool,
    pub fail_listing: AtomicBool,
    pub writes: Mutex<Vec<Written>>,
    pub listing: Mutex<HashMap<String, Vec<ListedRecord>>>,
}

impl MockLedger {
    pub fn writes(&self) -> Vec<Written> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_listing(&self, collection: &str, records: Vec<ListedRecord>) {
        self.listing.lock().unwrap().insert(collection.to_string(), records);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn put_record(
        &self,
        account: &str,
        collection: &str,
        rkey: &str,
        record: serde_json::Value,
    ) -> Result<String, LedgerError> {
        // Let other publishes interleave, as a real round trip would
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::RemoteWrite("PDS unavailable".into()));
        }
        let uri = at_uri(account, collection, rkey);
        self.writes.lock().unwrap().push(Written {
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            uri: uri.clone(),
            record,
        });
        Ok(uri)
    }

    async fn list_records(&self, _account: &str, collection: &str) -> Result<Vec<ListedRecord>, LedgerError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(LedgerError::Remote("listRecords returned HTTP 502".into()));
        }
        Ok(self.listing.lock().unwrap().get(collection).cloned().unwrap_or_default())
    }
}

pub struct MockResolver;

#[async_trait]
impl HandleResolver for MockResolver {
    async fn resolve_handle(&self, did: &str) -> Result<Option<String>, LedgerError> {
        match did.strip_prefix("did:plc:") {
            Some(name) => Ok(Some(format!("{}.test", name))),
            None => Err(LedgerError::Remote("unresolvable".into())),
        }
    }

    async fn resolve_did(&self, handle: &str) -> Result<Option<String>, LedgerError> {
        Ok(handle.strip_suffix(".test").map(|name| format!("did:plc:{}", name)))
    }
}

pub struct MockEmbeds;

#[async_trait]
impl EmbedFetcher for MockEmbeds {
    async fn fetch_embed(&self, subject: &str) -> Result<String, LedgerError> {
        Ok(format!("<blockquote>{}</blockquote>", subject))
    }
}

pub struct Harness {
    pub engine: Engine,
    pub db: Arc<LedgerDb>,
    pub ledger: Arc<MockLedger>,
}

pub fn harness() -> Harness {
    harness_with_db(Arc::new(LedgerDb::open_in_memory().unwrap()))
}

pub fn harness_with_db(db: Arc<LedgerDb>) -> Harness {
    harness_with(db, Arc::new(MockLedger::default()))
}

/// Engine over a database and ledger that other harnesses may share
pub fn harness_with(db: Arc<LedgerDb>, ledger: Arc<MockLedger>) -> Harness {
    let config = Config {
        service_did: SVC.to_string(),
        bootstrap_allowed: vec![FOUNDER.to_string()],
        ..Config::default()
    };
    let collaborators = Collaborators {
        ledger: ledger.clone(),
        validator: Arc::new(LexiconValidator::new()),
        resolver: Arc::new(MockResolver),
        embeds: Arc::new(MockEmbeds),
    };

    Harness {
        engine: Engine::new(config, db.clone(), collaborators),
        db,
        ledger,
    }
}

pub fn post(n: u32) -> String {
    format!("at://did:plc:poster/app.bsky.feed.post/{}", n)
}

/// Jetstream commit frame for the service account
pub fn commit_frame(operation: &str, collection: &str, rkey: &str, record: Option<&serde_json::Value>, cursor: i64) -> String {
    let mut commit = serde_json::json!({
        "rev": "3lxyz",
        "operation": operation,
        "collection": collection,
        "rkey": rkey,
    });
    if let Some(record) = record {
        commit["record"] = record.clone();
        commit["cid"] = serde_json::json!("bafyreigh2akiscaildc");
    }
    serde_json::json!({
        "did": SVC,
        "time_us": cursor,
        "kind": "commit",
        "commit": commit,
    })
    .to_string()
}
