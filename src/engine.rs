//! Engine context
//!
//! Owns the database and every component built on it. The web layer holds one
//! `Engine` and calls through it; nothing in the crate is a global.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::backfill::{BackfillReconciler, BackfillReport};
use crate::checkpoint::CursorCheckpointStore;
use crate::config::{Config, PublishMode};
use crate::db::{DbStats, LedgerDb};
use crate::embed::{EmbedCache, EmbedFetcher, OEmbedFetcher};
use crate::error::LedgerError;
use crate::ledger::{LedgerClient, OfflineLedger, XrpcLedgerClient, XrpcLedgerConfig};
use crate::proposals::{HydratedProposal, ProposalPage, ProposalRepository};
use crate::publish::PublishCoordinator;
use crate::records::{ProposalKind, ProposalType};
use crate::resolver::{HandleResolver, XrpcHandleResolver, XrpcResolverConfig};
use crate::stream::{StreamClient, StreamClientConfig, StreamMaterializer};
use crate::validation::{LexiconValidator, RecordValidator};
use crate::voting::VotingLedger;

/// External services the engine talks to
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub validator: Arc<dyn RecordValidator>,
    pub resolver: Arc<dyn HandleResolver>,
    pub embeds: Arc<dyn EmbedFetcher>,
}

impl Collaborators {
    /// Network-backed defaults. Offline mode swaps in a ledger that never
    /// leaves the process.
    pub fn from_config(config: &Config) -> Self {
        let ledger: Arc<dyn LedgerClient> = match config.publish_mode {
            PublishMode::Live => Arc::new(XrpcLedgerClient::new(XrpcLedgerConfig {
                pds_url: config.pds_url.clone(),
                identifier: config.service_identifier.clone(),
                password: config.service_password.clone(),
                request_timeout: config.request_timeout(),
            })),
            PublishMode::Offline => Arc::new(OfflineLedger),
        };

        Self {
            ledger,
            validator: Arc::new(LexiconValidator::new()),
            resolver: Arc::new(XrpcHandleResolver::new(XrpcResolverConfig {
                appview_url: config.appview_url.clone(),
                request_timeout: config.request_timeout(),
                ..Default::default()
            })),
            embeds: Arc::new(OEmbedFetcher::new(config.embed_endpoint.clone(), config.request_timeout())),
        }
    }
}

pub struct Engine {
    config: Config,
    db: Arc<LedgerDb>,
    ledger: Arc<dyn LedgerClient>,
    validator: Arc<dyn RecordValidator>,
    voting: Arc<VotingLedger>,
    repository: ProposalRepository,
    publisher: PublishCoordinator,
}

impl Engine {
    /// Open the configured database and wire up the default collaborators
    pub fn from_config(config: Config) -> Result<Self, LedgerError> {
        config.validate()?;
        let db = match config.db_path() {
            Some(path) => {
                std::fs::create_dir_all(&config.data_dir)?;
                LedgerDb::open(&path)?
            }
            None => LedgerDb::open_in_memory()?,
        };
        let collaborators = Collaborators::from_config(&config);
        Ok(Self::new(config, Arc::new(db), collaborators))
    }

    pub fn new(config: Config, db: Arc<LedgerDb>, collaborators: Collaborators) -> Self {
        let voting = Arc::new(VotingLedger::new(db.clone(), config.bootstrap_allowed.clone()));
        let embeds = Arc::new(EmbedCache::new(db.clone(), collaborators.embeds));
        let repository = ProposalRepository::new(db.clone(), voting.clone(), embeds, collaborators.resolver);
        let publisher = PublishCoordinator::new(
            db.clone(),
            collaborators.ledger.clone(),
            collaborators.validator.clone(),
            voting.clone(),
            config.repo_account(),
            config.allowed_labels.clone(),
        );

        Self {
            config,
            db,
            ledger: collaborators.ledger,
            validator: collaborators.validator,
            voting,
            repository,
            publisher,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initial backfill followed by the live stream, until `shutdown` fires.
    ///
    /// In offline mode there is no remote ledger to follow, so this only waits
    /// for shutdown.
    pub async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), LedgerError> {
        if self.config.publish_mode == PublishMode::Offline {
            warn!("Offline mode: not following the remote ledger, local rows are unpublished");
            let _ = shutdown.recv().await;
            return Ok(());
        }

        if self.config.backfill_on_start {
            match self.backfill().await {
                Ok(report) => info!(inserted = report.inserted(), "Initial backfill complete"),
                Err(e) => error!(error = %e, "Initial backfill failed, continuing with the stream"),
            }
        }

        let checkpoints = CursorCheckpointStore::open(
            self.db.clone(),
            self.config.cursor_threshold,
            self.config.cursor_retention(),
        )?;
        let mut materializer = StreamMaterializer::new(
            self.db.clone(),
            self.validator.clone(),
            self.config.repo_account(),
            checkpoints,
        );

        let client = StreamClient::new(StreamClientConfig {
            start_cursor: self.config.start_cursor,
            reconnect_delay: self.config.reconnect_delay(),
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            ..StreamClientConfig::new(self.config.jetstream_url.clone(), self.config.repo_account())
        });
        client.run(&mut materializer, shutdown).await
    }

    /// One backfill pass against the remote ledger
    pub async fn backfill(&self) -> Result<BackfillReport, LedgerError> {
        BackfillReconciler::new(
            self.db.clone(),
            self.ledger.clone(),
            self.validator.clone(),
            self.config.repo_account(),
        )
        .run()
        .await
    }

    pub async fn publish_proposal(&self, kind: ProposalKind, creator: &str) -> Result<String, LedgerError> {
        self.publisher.publish_proposal(kind, creator).await
    }

    pub async fn publish_vote(&self, value: i64, subject: &str, voter: &str) -> Result<String, LedgerError> {
        self.publisher.publish_vote(value, subject, voter).await
    }

    pub async fn list(
        &self,
        proposal_type: ProposalType,
        page_size: u32,
        page: u32,
        requester: Option<&str>,
    ) -> Result<ProposalPage, LedgerError> {
        self.repository.list(proposal_type, page_size, page, requester).await
    }

    pub async fn get(&self, uri: &str, requester: Option<&str>) -> Result<Option<HydratedProposal>, LedgerError> {
        self.repository.get(uri, requester).await
    }

    pub async fn get_by_rkey(&self, rkey: &str, requester: Option<&str>) -> Result<Option<HydratedProposal>, LedgerError> {
        self.repository.get_by_rkey(rkey, requester).await
    }

    pub fn has_voted(&self, voter: &str, subject: &str) -> Result<bool, LedgerError> {
        self.voting.has_voted(voter, subject)
    }

    pub fn score_of(&self, subject: &str) -> Result<i64, LedgerError> {
        self.voting.score_of(subject)
    }

    pub fn scores_of(&self, subjects: &[String]) -> Result<std::collections::HashMap<String, i64>, LedgerError> {
        self.voting.scores_of(subjects)
    }

    pub fn whitelisted(&self, candidate: &str) -> Result<bool, LedgerError> {
        self.voting.whitelisted(candidate)
    }

    pub fn stats(&self) -> Result<DbStats, LedgerError> {
        self.db.stats()
    }
}
