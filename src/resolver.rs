//! Account identifier <-> handle resolution
//!
//! Only used to decorate allow-user proposals for display, so failures are
//! reported to the caller and never block anything else.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LedgerError;

#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// DID -> handle
    async fn resolve_handle(&self, did: &str) -> Result<Option<String>, LedgerError>;

    /// handle -> DID
    async fn resolve_did(&self, handle: &str) -> Result<Option<String>, LedgerError>;
}

#[derive(Debug, Clone)]
pub struct XrpcResolverConfig {
    /// Public AppView serving `app.bsky.actor.getProfile` and `resolveHandle`
    pub appview_url: String,
    pub request_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for XrpcResolverConfig {
    fn default() -> Self {
        Self {
            appview_url: "https://public.api.bsky.app".to_string(),
            request_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

struct CachedHandle {
    handle: Option<String>,
    expires_at: Instant,
}

/// Resolver backed by AppView XRPC calls, with a TTL cache for DID lookups
pub struct XrpcHandleResolver {
    config: XrpcResolverConfig,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CachedHandle>>,
}

impl XrpcHandleResolver {
    pub fn new(config: XrpcResolverConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn xrpc_url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.config.appview_url.trim_end_matches('/'), method)
    }

    async fn cached(&self, did: &str) -> Option<Option<String>> {
        let cache = self.cache.read().await;
        cache
            .get(did)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.handle.clone())
    }
}

#[async_trait]
impl HandleResolver for XrpcHandleResolver {
    async fn resolve_handle(&self, did: &str) -> Result<Option<String>, LedgerError> {
        if let Some(hit) = self.cached(did).await {
            return Ok(hit);
        }

        let response = self
            .http
            .get(self.xrpc_url("app.bsky.actor.getProfile"))
            .query(&[("actor", did)])
            .send()
            .await
            .map_err(|e| LedgerError::Remote(format!("getProfile failed: {}", e)))?;

        let handle = if response.status() == reqwest::StatusCode::BAD_REQUEST
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            None
        } else if response.status().is_success() {
            let profile: ProfileResponse = response
                .json()
                .await
                .map_err(|e| LedgerError::Decode(format!("Invalid profile response: {}", e)))?;
            Some(profile.handle)
        } else {
            return Err(LedgerError::Remote(format!("getProfile returned HTTP {}", response.status())));
        };

        debug!(did = %did, handle = ?handle, "Resolved handle");
        let mut cache = self.cache.write().await;
        cache.retain(|_, c| c.expires_at > Instant::now());
        cache.insert(
            did.to_string(),
            CachedHandle {
                handle: handle.clone(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
        Ok(handle)
    }

    async fn resolve_did(&self, handle: &str) -> Result<Option<String>, LedgerError> {
        let response = self
            .http
            .get(self.xrpc_url("com.atproto.identity.resolveHandle"))
            .query(&[("handle", handle)])
            .send()
            .await
            .map_err(|e| LedgerError::Remote(format!("resolveHandle failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LedgerError::Remote(format!("resolveHandle returned HTTP {}", response.status())));
        }

        let resolved: ResolveHandleResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("Invalid resolveHandle response: {}", e)))?;
        Ok(Some(resolved.did))
    }
}
