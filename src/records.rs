//! Ledger record types
//!
//! Lexicon records as they appear on the wire, the collections we watch, and
//! the tagged [`ProposalKind`] used everywhere a proposal's variant matters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub const PROPOSAL_COLLECTION: &str = "social.pmsky.proposal";
/// Older label-only collection; its records are LABEL proposals.
pub const LABEL_COLLECTION: &str = "social.pmsky.label";
pub const VOTE_COLLECTION: &str = "social.pmsky.vote";

/// Fixed `val` carried by allow-user proposals
pub const ALLOWED_USER_MARKER: &str = "allowed_user";

/// Watched record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Proposal,
    Label,
    Vote,
}

impl Collection {
    pub const WATCHED: [Collection; 3] = [Collection::Proposal, Collection::Label, Collection::Vote];

    pub fn nsid(&self) -> &'static str {
        match self {
            Collection::Proposal => PROPOSAL_COLLECTION,
            Collection::Label => LABEL_COLLECTION,
            Collection::Vote => VOTE_COLLECTION,
        }
    }

    pub fn from_nsid(nsid: &str) -> Option<Self> {
        match nsid {
            PROPOSAL_COLLECTION => Some(Collection::Proposal),
            LABEL_COLLECTION => Some(Collection::Label),
            VOTE_COLLECTION => Some(Collection::Vote),
            _ => None,
        }
    }

    pub fn is_proposal(&self) -> bool {
        matches!(self, Collection::Proposal | Collection::Label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    Label,
    AllowedUser,
}

impl ProposalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalType::Label => "label",
            ProposalType::AllowedUser => "allowed_user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "label" => Some(ProposalType::Label),
            "allowed_user" => Some(ProposalType::AllowedUser),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProposalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a proposal proposes. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalKind {
    /// Apply `value` as a label to the post at `post`
    Label { value: String, post: String },
    /// Admit `candidate` (an account identifier) as a member
    AllowedUser { candidate: String },
}

impl ProposalKind {
    pub fn label(value: impl Into<String>, post: impl Into<String>) -> Self {
        ProposalKind::Label {
            value: value.into(),
            post: post.into(),
        }
    }

    pub fn allowed_user(candidate: impl Into<String>) -> Self {
        ProposalKind::AllowedUser {
            candidate: candidate.into(),
        }
    }

    pub fn proposal_type(&self) -> ProposalType {
        match self {
            ProposalKind::Label { .. } => ProposalType::Label,
            ProposalKind::AllowedUser { .. } => ProposalType::AllowedUser,
        }
    }

    /// Stored `value` column
    pub fn value(&self) -> &str {
        match self {
            ProposalKind::Label { value, .. } => value,
            ProposalKind::AllowedUser { .. } => ALLOWED_USER_MARKER,
        }
    }

    /// Stored `subject` column
    pub fn subject(&self) -> &str {
        match self {
            ProposalKind::Label { post, .. } => post,
            ProposalKind::AllowedUser { candidate } => candidate,
        }
    }

    pub fn from_parts(proposal_type: ProposalType, value: &str, subject: &str) -> Self {
        match proposal_type {
            ProposalType::Label => ProposalKind::label(value, subject),
            ProposalType::AllowedUser => ProposalKind::allowed_user(subject),
        }
    }
}

/// `social.pmsky.proposal` (and legacy `social.pmsky.label`) record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    /// Absent on legacy label records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Actor who created the proposal
    pub src: String,
    /// Subject the proposal applies to
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub val: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    pub cts: String,
}

impl ProposalRecord {
    pub fn new(kind: &ProposalKind, src: &str, cts: String) -> Self {
        Self {
            record_type: PROPOSAL_COLLECTION.to_string(),
            typ: Some(kind.proposal_type().as_str().to_string()),
            src: src.to_string(),
            uri: kind.subject().to_string(),
            cid: None,
            val: kind.value().to_string(),
            note: None,
            reasons: Vec::new(),
            aid: None,
            cts,
        }
    }

    /// Proposal type, defaulting legacy label records to LABEL
    pub fn proposal_type(&self, collection: Collection) -> Result<ProposalType, LedgerError> {
        match (&self.typ, collection) {
            (None, Collection::Label) => Ok(ProposalType::Label),
            (Some(typ), _) => ProposalType::parse(typ).ok_or_else(|| {
                LedgerError::invalid_record(collection.nsid(), format!("unknown proposal type '{}'", typ))
            }),
            (None, _) => Err(LedgerError::invalid_record(collection.nsid(), "missing typ")),
        }
    }

    pub fn kind(&self, collection: Collection) -> Result<ProposalKind, LedgerError> {
        Ok(ProposalKind::from_parts(self.proposal_type(collection)?, &self.val, &self.uri))
    }
}

/// `social.pmsky.vote` record. Carries no voter identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    /// Account that published the vote (the service account)
    pub src: String,
    /// Proposal URI being voted on
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    pub val: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aid: Option<String>,
    pub cts: String,
}

impl VoteRecord {
    pub fn new(src: &str, subject: &str, val: i64, cts: String) -> Self {
        Self {
            record_type: VOTE_COLLECTION.to_string(),
            src: src.to_string(),
            uri: subject.to_string(),
            cid: None,
            val,
            reasons: Vec::new(),
            aid: None,
            cts,
        }
    }
}

/// `at://{account}/{collection}/{rkey}`
pub fn at_uri(account: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", account, collection, rkey)
}

/// Split an AT URI into (account, collection, rkey)
pub fn parse_at_uri(uri: &str) -> Option<(&str, &str, &str)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let account = parts.next().filter(|s| !s.is_empty())?;
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((account, collection, rkey))
}

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

static LAST_TID_MICROS: AtomicU64 = AtomicU64::new(0);
static CLOCK_ID: OnceLock<u64> = OnceLock::new();

/// Fresh timestamp record key: 53 bits of microseconds, 10 bits of clock id,
/// sortable base32. Strictly increasing within the process.
pub fn next_rkey() -> String {
    let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let mut last = LAST_TID_MICROS.load(Ordering::Relaxed);
    let micros = loop {
        let candidate = now.max(last + 1);
        match LAST_TID_MICROS.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => break candidate,
            Err(actual) => last = actual,
        }
    };
    let clock_id = *CLOCK_ID.get_or_init(|| rand::random::<u64>() & 0x3ff);
    encode_tid(((micros & 0x1f_ffff_ffff_ffff) << 10) | clock_id)
}

fn encode_tid(mut id: u64) -> String {
    let mut out = [0u8; 13];
    for slot in out.iter_mut().rev() {
        *slot = TID_ALPHABET[(id & 31) as usize];
        id >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}

/// Current time as an RFC 3339 timestamp with millisecond precision
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
