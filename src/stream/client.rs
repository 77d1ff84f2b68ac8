//! Jetstream subscription with reconnects
//!
//! Frames are handed to the materializer one at a time, in arrival order. On
//! disconnect the client waits `reconnect_delay` and resubscribes from the
//! materializer's resume cursor; events replayed because of that are
//! harmless. An event the materializer could not store also ends the
//! connection, so it is delivered again.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};
use url::Url;

use super::transport::Transport;
use super::{EventOutcome, StreamMaterializer};
use crate::error::LedgerError;
use crate::records::Collection;

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Jetstream `subscribe` endpoint
    pub endpoint: String,
    /// Only events from this account are requested
    pub source_did: String,
    pub collections: Vec<String>,
    /// Used when neither the process nor the database has a cursor
    pub start_cursor: Option<i64>,
    pub reconnect_delay: Duration,
    /// Maximum consecutive failed connections (0 = unlimited)
    pub max_reconnect_attempts: u32,
}

impl StreamClientConfig {
    pub fn new(endpoint: impl Into<String>, source_did: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            source_did: source_did.into(),
            collections: Collection::WATCHED.iter().map(|c| c.nsid().to_string()).collect(),
            start_cursor: None,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 0,
        }
    }
}

pub struct StreamClient {
    config: StreamClientConfig,
}

impl StreamClient {
    pub fn new(config: StreamClientConfig) -> Self {
        Self { config }
    }

    /// Subscription URL for the given resume cursor
    pub fn subscribe_url(&self, cursor: Option<i64>) -> Result<Url, LedgerError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|e| LedgerError::Config(format!("Invalid jetstream URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            for collection in &self.config.collections {
                query.append_pair("wantedCollections", collection);
            }
            query.append_pair("wantedDids", &self.config.source_did);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        Ok(url)
    }

    /// Consume the stream until shutdown, or until the reconnect budget runs out
    pub async fn run(
        &self,
        materializer: &mut StreamMaterializer,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), LedgerError> {
        let mut failures = 0u32;

        loop {
            let cursor = materializer.resume_cursor().or(self.config.start_cursor);
            let url = self.subscribe_url(cursor)?;
            info!(cursor = ?cursor, "Subscribing to ledger stream");

            match self.consume(url.as_str(), materializer, &mut shutdown).await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Closed) => {
                    info!("Stream closed by server");
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, attempt = failures, "Stream connection failed");
                    if self.config.max_reconnect_attempts > 0 && failures >= self.config.max_reconnect_attempts {
                        return Err(LedgerError::Stream(format!(
                            "giving up after {} failed connection attempts",
                            failures
                        )));
                    }
                }
            }

            info!(delay = ?self.config.reconnect_delay, "Reconnecting to ledger stream");
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("Ledger stream stopped");
        Ok(())
    }

    async fn consume(
        &self,
        url: &str,
        materializer: &mut StreamMaterializer,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Exit, LedgerError> {
        let mut transport = Transport::connect(url).await?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    transport.close().await;
                    return Ok(Exit::Shutdown);
                }
                frame = transport.recv() => match frame {
                    Ok(Some(text)) => {
                        if materializer.handle_frame(&text) == EventOutcome::Deferred {
                            transport.close().await;
                            return Err(LedgerError::Stream("event deferred, resubscribing from last cursor".into()));
                        }
                    }
                    Ok(None) => return Ok(Exit::Closed),
                    Err(e) => {
                        warn!(error = %e, "Stream receive failed");
                        return Err(e);
                    }
                },
            }
        }
    }
}

enum Exit {
    Shutdown,
    Closed,
}
