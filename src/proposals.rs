//! Read side: paged, hydrated proposal listings
//!
//! Each listed proposal carries its score, whether the requester has already
//! voted on it, and a display decoration that depends on its variant.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{proposals, LedgerDb, ProposalRow};
use crate::embed::EmbedCache;
use crate::error::LedgerError;
use crate::records::{ProposalKind, ProposalType};
use crate::resolver::HandleResolver;
use crate::voting::VotingLedger;

/// Largest page a caller may ask for
pub const MAX_PAGE_SIZE: u32 = 100;

/// Variant-specific display data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decoration {
    /// Preview HTML of the labelled post, when it could be fetched
    Label { embed: Option<String> },
    /// Handle of the candidate account, when it resolves
    AllowedUser { handle: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct HydratedProposal {
    pub rkey: String,
    pub uri: String,
    pub creator: String,
    pub kind: ProposalKind,
    pub created_at: String,
    pub indexed_at: String,
    pub score: i64,
    pub already_voted: bool,
    pub decoration: Decoration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalPage {
    pub proposals: Vec<HydratedProposal>,
    /// Page actually returned (may be lower than requested)
    pub page: u32,
    pub has_next: bool,
}

pub struct ProposalRepository {
    db: Arc<LedgerDb>,
    voting: Arc<VotingLedger>,
    embeds: Arc<EmbedCache>,
    resolver: Arc<dyn HandleResolver>,
}

impl ProposalRepository {
    pub fn new(
        db: Arc<LedgerDb>,
        voting: Arc<VotingLedger>,
        embeds: Arc<EmbedCache>,
        resolver: Arc<dyn HandleResolver>,
    ) -> Self {
        Self {
            db,
            voting,
            embeds,
            resolver,
        }
    }

    /// Newest-first page of proposals of one type. Pages are zero-based and
    /// `page_size` is clamped to `1..=MAX_PAGE_SIZE`.
    ///
    /// When a page past the first is empty, the last non-empty page is
    /// returned instead, with `has_next = false`.
    pub async fn list(
        &self,
        proposal_type: ProposalType,
        page_size: u32,
        page: u32,
        requester: Option<&str>,
    ) -> Result<ProposalPage, LedgerError> {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let mut page = page;

        let mut rows = self.fetch_page(proposal_type, page_size, page)?;
        let mut has_next = rows.len() > page_size as usize;

        if rows.is_empty() && page > 0 {
            let total = self.db.with_conn(|conn| proposals::count_by_type(conn, proposal_type))?;
            let last = total.saturating_sub(1) / u64::from(page_size);
            let fallback = u32::try_from(last).unwrap_or(u32::MAX).min(page - 1);
            debug!(requested = page, page = fallback, "Requested page is empty, falling back");

            page = fallback;
            rows = self.fetch_page(proposal_type, page_size, page)?;
            has_next = false;
        }
        rows.truncate(page_size as usize);

        let proposals = self.hydrate_all(rows, requester).await?;
        Ok(ProposalPage {
            proposals,
            page,
            has_next,
        })
    }

    pub async fn get(&self, uri: &str, requester: Option<&str>) -> Result<Option<HydratedProposal>, LedgerError> {
        let row = self.db.with_conn(|conn| proposals::get_by_uri(conn, uri))?;
        self.hydrate_one(row, requester).await
    }

    pub async fn get_by_rkey(&self, rkey: &str, requester: Option<&str>) -> Result<Option<HydratedProposal>, LedgerError> {
        let row = self.db.with_conn(|conn| proposals::get_by_rkey(conn, rkey))?;
        self.hydrate_one(row, requester).await
    }

    /// One extra row is fetched to tell whether a next page exists
    fn fetch_page(&self, proposal_type: ProposalType, page_size: u32, page: u32) -> Result<Vec<ProposalRow>, LedgerError> {
        let limit = u64::from(page_size) + 1;
        let offset = u64::from(page)
            .checked_mul(u64::from(page_size))
            .ok_or_else(|| LedgerError::Internal(format!("Page offset overflows for page {}", page)))?;
        self.db
            .with_conn(|conn| proposals::list_page(conn, proposal_type, limit, offset))
    }

    async fn hydrate_one(
        &self,
        row: Option<ProposalRow>,
        requester: Option<&str>,
    ) -> Result<Option<HydratedProposal>, LedgerError> {
        match row {
            Some(row) => Ok(self.hydrate_all(vec![row], requester).await?.pop()),
            None => Ok(None),
        }
    }

    async fn hydrate_all(
        &self,
        rows: Vec<ProposalRow>,
        requester: Option<&str>,
    ) -> Result<Vec<HydratedProposal>, LedgerError> {
        let uris: Vec<String> = rows.iter().map(|r| r.uri.clone()).collect();
        let scores = self.voting.scores_of(&uris)?;

        let mut hydrated = Vec::with_capacity(rows.len());
        for row in rows {
            let already_voted = match requester {
                Some(voter) => self.voting.has_voted(voter, &row.uri)?,
                None => false,
            };
            let kind = row.kind();
            let decoration = self.decorate(&kind).await;

            hydrated.push(HydratedProposal {
                score: scores.get(&row.uri).copied().unwrap_or(0),
                already_voted,
                decoration,
                kind,
                rkey: row.rkey,
                uri: row.uri,
                creator: row.creator,
                created_at: row.created_at,
                indexed_at: row.indexed_at,
            });
        }
        Ok(hydrated)
    }

    async fn decorate(&self, kind: &ProposalKind) -> Decoration {
        match kind {
            ProposalKind::Label { post, .. } => {
                let embed = match self.embeds.get_or_fetch(post).await {
                    Ok(html) => Some(html),
                    Err(e) => {
                        warn!(subject = %post, error = %e, "Embed unavailable");
                        None
                    }
                };
                Decoration::Label { embed }
            }
            ProposalKind::AllowedUser { candidate } => {
                let handle = match self.resolver.resolve_handle(candidate).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(candidate = %candidate, error = %e, "Handle resolution failed");
                        None
                    }
                };
                Decoration::AllowedUser { handle }
            }
        }
    }
}
