//! Remote ledger client
//!
//! The ledger is a per-account record repository reached over XRPC. Two calls
//! matter here: `putRecord` for publishing and a paged `listRecords` for
//! backfill. A failed write is terminal for that request, with one exception:
//! a write rejected for its session token is sent once more after the session
//! has been renewed.
//!
//! Sessions are created lazily on the first write. An expired access token is
//! renewed with the session's refresh token; if that fails too, the session is
//! dropped and the next write logs in again.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::records::at_uri;

/// Page size for listRecords
const LIST_PAGE_LIMIT: u32 = 100;

/// A record as returned by listRecords
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

/// Remote ledger seam (allows mocking in tests)
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Write `record` under `account/collection/rkey`, returning its URI
    async fn put_record(
        &self,
        account: &str,
        collection: &str,
        rkey: &str,
        record: serde_json::Value,
    ) -> Result<String, LedgerError>;

    /// Every current record in `account/collection`
    async fn list_records(&self, account: &str, collection: &str) -> Result<Vec<ListedRecord>, LedgerError>;
}

#[derive(Debug, Clone)]
pub struct XrpcLedgerConfig {
    pub pds_url: String,
    pub identifier: String,
    pub password: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
}

/// Body of a failed XRPC call
#[derive(Debug, Default, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl XrpcErrorBody {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }
}

/// True when the PDS turned a call down because of its token, not its content.
///
/// Expired access tokens come back as HTTP 400 `ExpiredToken`, not 401.
fn is_session_rejection(status: reqwest::StatusCode, body: &XrpcErrorBody) -> bool {
    match body.error.as_deref() {
        Some("ExpiredToken") | Some("InvalidToken") => {
            status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        }
        _ => status == reqwest::StatusCode::UNAUTHORIZED,
    }
}

enum PutAttempt {
    Written(String),
    SessionRejected(String),
}

#[derive(Debug, Deserialize)]
struct PutRecordResponse {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    cursor: Option<String>,
    records: Vec<ListedRecord>,
}

/// XRPC client against the service account's PDS
pub struct XrpcLedgerClient {
    config: XrpcLedgerConfig,
    http: reqwest::Client,
    session: RwLock<Option<Session>>,
}

impl XrpcLedgerClient {
    pub fn new(config: XrpcLedgerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("moderation-ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            session: RwLock::new(None),
        }
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.config.pds_url.trim_end_matches('/'), method)
    }

    async fn access_token(&self) -> Result<String, LedgerError> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.access_jwt.clone());
        }

        let mut slot = self.session.write().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.access_jwt.clone());
        }

        let response = self
            .http
            .post(self.xrpc_url("com.atproto.server.createSession"))
            .json(&serde_json::json!({
                "identifier": self.config.identifier,
                "password": self.config.password,
            }))
            .send()
            .await
            .map_err(|e| LedgerError::Remote(format!("createSession failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LedgerError::Remote(format!(
                "createSession returned HTTP {}",
                response.status()
            )));
        }

        let session: Session = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("Invalid session response: {}", e)))?;

        info!(did = %session.did, "Service account session created");
        let token = session.access_jwt.clone();
        *slot = Some(session);
        Ok(token)
    }

    /// Replace the session whose access token was `stale`.
    ///
    /// A no-op when another write already renewed it. When the refresh call
    /// fails the session is dropped, so the next token request logs in.
    async fn renew_session(&self, stale: &str) {
        let mut slot = self.session.write().await;
        let refresh_jwt = match slot.as_ref() {
            Some(session) if session.access_jwt == stale => session.refresh_jwt.clone(),
            _ => return,
        };

        match self.refresh_session(&refresh_jwt).await {
            Ok(session) => {
                info!(did = %session.did, "Service account session refreshed");
                *slot = Some(session);
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed, will log in again");
                *slot = None;
            }
        }
    }

    async fn refresh_session(&self, refresh_jwt: &str) -> Result<Session, LedgerError> {
        let response = self
            .http
            .post(self.xrpc_url("com.atproto.server.refreshSession"))
            .bearer_auth(refresh_jwt)
            .send()
            .await
            .map_err(|e| LedgerError::Remote(format!("refreshSession failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LedgerError::Remote(format!(
                "refreshSession returned HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("Invalid session response: {}", e)))
    }

    async fn put_once(&self, token: &str, body: &serde_json::Value) -> Result<PutAttempt, LedgerError> {
        let response = self
            .http
            .post(self.xrpc_url("com.atproto.repo.putRecord"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| LedgerError::RemoteWrite(format!("putRecord failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = XrpcErrorBody::parse(&text);
            let reason = format!(
                "HTTP {} {}: {}",
                status,
                error.error.as_deref().unwrap_or("unknown"),
                error.message.as_deref().unwrap_or(&text)
            );
            if is_session_rejection(status, &error) {
                return Ok(PutAttempt::SessionRejected(reason));
            }
            return Err(LedgerError::RemoteWrite(format!("putRecord returned {}", reason)));
        }

        let put: PutRecordResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::RemoteWrite(format!("Invalid putRecord response: {}", e)))?;
        Ok(PutAttempt::Written(put.uri))
    }

    async fn write_token(&self) -> Result<String, LedgerError> {
        self.access_token()
            .await
            .map_err(|e| LedgerError::RemoteWrite(e.to_string()))
    }
}

#[async_trait]
impl LedgerClient for XrpcLedgerClient {
    async fn put_record(
        &self,
        account: &str,
        collection: &str,
        rkey: &str,
        record: serde_json::Value,
    ) -> Result<String, LedgerError> {
        let body = serde_json::json!({
            "repo": account,
            "collection": collection,
            "rkey": rkey,
            "record": record,
            "validate": false,
        });

        let token = self.write_token().await?;
        let reason = match self.put_once(&token, &body).await? {
            PutAttempt::Written(uri) => {
                debug!(uri = %uri, "Record written to ledger");
                return Ok(uri);
            }
            PutAttempt::SessionRejected(reason) => reason,
        };

        warn!(reason = %reason, "PDS rejected session token, renewing");
        self.renew_session(&token).await;

        let token = self.write_token().await?;
        match self.put_once(&token, &body).await? {
            PutAttempt::Written(uri) => {
                debug!(uri = %uri, "Record written to ledger after session renewal");
                Ok(uri)
            }
            PutAttempt::SessionRejected(reason) => {
                *self.session.write().await = None;
                Err(LedgerError::RemoteWrite(format!(
                    "putRecord rejected renewed session: {}",
                    reason
                )))
            }
        }
    }

    async fn list_records(&self, account: &str, collection: &str) -> Result<Vec<ListedRecord>, LedgerError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let limit = LIST_PAGE_LIMIT.to_string();

        loop {
            let mut query = vec![("repo", account), ("collection", collection), ("limit", limit.as_str())];
            if let Some(ref c) = cursor {
                query.push(("cursor", c.as_str()));
            }

            let response = self
                .http
                .get(self.xrpc_url("com.atproto.repo.listRecords"))
                .query(&query)
                .send()
                .await
                .map_err(|e| LedgerError::Remote(format!("listRecords failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(LedgerError::Remote(format!(
                    "listRecords returned HTTP {} for {}",
                    response.status(),
                    collection
                )));
            }

            let page: ListRecordsResponse = response
                .json()
                .await
                .map_err(|e| LedgerError::Decode(format!("Invalid listRecords response: {}", e)))?;

            let page_len = page.records.len();
            records.extend(page.records);
            debug!(collection = %collection, page = page_len, total = records.len(), "Listed records page");

            match page.cursor {
                Some(next) if page_len > 0 && cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(records)
    }
}

/// Ledger used when publishing is disabled.
///
/// Writes succeed without leaving the process and listings are empty. Rows
/// mirrored under this ledger exist only locally.
#[derive(Debug, Clone, Default)]
pub struct OfflineLedger;

#[async_trait]
impl LedgerClient for OfflineLedger {
    async fn put_record(
        &self,
        account: &str,
        collection: &str,
        rkey: &str,
        _record: serde_json::Value,
    ) -> Result<String, LedgerError> {
        debug!(collection = %collection, rkey = %rkey, "Offline mode: record not published");
        Ok(at_uri(account, collection, rkey))
    }

    async fn list_records(&self, _account: &str, _collection: &str) -> Result<Vec<ListedRecord>, LedgerError> {
        Ok(vec![])
    }
}
