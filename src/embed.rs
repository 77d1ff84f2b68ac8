//! Post preview embeds
//!
//! A read-through cache over an oEmbed endpoint. Entries never expire; a post's
//! embed HTML does not change in a way that matters for a moderation card.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::{embeds, LedgerDb};
use crate::error::LedgerError;
use crate::records::now_timestamp;

#[async_trait]
pub trait EmbedFetcher: Send + Sync {
    async fn fetch_embed(&self, subject: &str) -> Result<String, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    html: String,
}

pub struct OEmbedFetcher {
    endpoint: String,
    http: reqwest::Client,
}

impl OEmbedFetcher {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            endpoint: endpoint.into(),
            http,
        }
    }
}

#[async_trait]
impl EmbedFetcher for OEmbedFetcher {
    async fn fetch_embed(&self, subject: &str) -> Result<String, LedgerError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("url", subject)])
            .send()
            .await
            .map_err(|e| LedgerError::Remote(format!("oEmbed request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(LedgerError::Remote(format!(
                "oEmbed returned HTTP {} for {}",
                response.status(),
                subject
            )));
        }

        let embed: OEmbedResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(format!("Invalid oEmbed response: {}", e)))?;
        Ok(embed.html)
    }
}

pub struct EmbedCache {
    db: Arc<LedgerDb>,
    fetcher: Arc<dyn EmbedFetcher>,
}

impl EmbedCache {
    pub fn new(db: Arc<LedgerDb>, fetcher: Arc<dyn EmbedFetcher>) -> Self {
        Self { db, fetcher }
    }

    pub fn cached(&self, subject: &str) -> Result<Option<String>, LedgerError> {
        self.db.with_conn(|conn| embeds::get_embed(conn, subject))
    }

    /// Cached HTML for `subject`, fetching and storing it on a miss
    pub async fn get_or_fetch(&self, subject: &str) -> Result<String, LedgerError> {
        if let Some(html) = self.cached(subject)? {
            return Ok(html);
        }

        debug!(subject = %subject, "Embed cache miss");
        let html = self.fetcher.fetch_embed(subject).await?;

        if let Err(e) = self
            .db
            .with_conn(|conn| embeds::put_embed(conn, subject, &html, &now_timestamp()))
        {
            warn!(subject = %subject, error = %e, "Failed to cache embed");
        }
        Ok(html)
    }
}
