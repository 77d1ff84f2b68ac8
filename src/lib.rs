//! Moderation Ledger - sync and anonymous-voting engine for community moderation
//!
//! Proposals (label a post, admit a user) and votes live in a remote per-account
//! ledger. This crate keeps a local SQLite materialization of that ledger current
//! and serves the queries a web layer needs on top of it.
//!
//! ## Architecture
//!
//! ```text
//!   Jetstream ──► StreamClient ──► StreamMaterializer ──┐
//!                                      │                 │
//!                          CursorCheckpointStore         ▼
//!   PDS listRecords ──► BackfillReconciler ─────────► LedgerDb ◄── ProposalRepository
//!                                                        ▲              │
//!   web layer ──► PublishCoordinator ──► PDS putRecord   │              ▼
//!                        └──── optimistic mirror ────────┘        VotingLedger
//! ```
//!
//! - The remote ledger is the only durable source of truth; the local database is
//!   an eventually-consistent materialized view.
//! - Every write path is an idempotent upsert or insert-ignore, so the stream,
//!   backfill and publish mirror can run concurrently without locks.
//! - Votes are stored as two relations: who voted (`voter_records`) and what the
//!   vote was (`value_records`). They share only the subject.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/moderation-ledger/
//! ├── ledger.db      # SQLite materialized view
//! └── config.toml    # Configuration
//! ```

pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod embed;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod proposals;
pub mod publish;
pub mod records;
pub mod resolver;
pub mod stream;
pub mod validation;
pub mod voting;

// Re-exports
pub use backfill::{BackfillReconciler, BackfillReport};
pub use checkpoint::CursorCheckpointStore;
pub use config::{Config, PublishMode};
pub use db::LedgerDb;
pub use embed::{EmbedCache, EmbedFetcher, OEmbedFetcher};
pub use engine::{Collaborators, Engine};
pub use error::LedgerError;
pub use ledger::{LedgerClient, ListedRecord, OfflineLedger, XrpcLedgerClient};
pub use proposals::{Decoration, HydratedProposal, ProposalPage, ProposalRepository};
pub use publish::PublishCoordinator;
pub use records::{Collection, ProposalKind, ProposalRecord, ProposalType, VoteRecord};
pub use resolver::{HandleResolver, XrpcHandleResolver};
pub use stream::{StreamClient, StreamClientConfig, StreamMaterializer};
pub use validation::{LexiconValidator, RecordValidator};
pub use voting::VotingLedger;
