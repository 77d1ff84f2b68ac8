//! Configuration for moderation-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("moderation-ledger")
}

/// Repository name used in offline mode when no service DID is configured
pub const OFFLINE_ACCOUNT: &str = "did:offline:local";

/// Whether proposals and votes are written to the remote ledger.
///
/// `Offline` is an explicit development mode: records are mirrored locally
/// under synthetic identifiers and the stream is not consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Live,
    Offline,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir` (`:memory:` for an in-memory db)
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// Default tracing directive level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_publish_mode")]
    pub publish_mode: PublishMode,

    /// DID of the service account that owns every proposal and vote record
    #[serde(default)]
    pub service_did: String,

    /// Login identifier (handle or email) for the service account
    #[serde(default)]
    pub service_identifier: String,

    /// App password for the service account
    #[serde(default, skip_serializing)]
    pub service_password: String,

    /// PDS hosting the service account repo
    #[serde(default = "default_pds_url")]
    pub pds_url: String,

    /// Public AppView used for handle resolution
    #[serde(default = "default_appview_url")]
    pub appview_url: String,

    /// Jetstream websocket endpoint
    #[serde(default = "default_jetstream_url")]
    pub jetstream_url: String,

    /// Cursor (microseconds) to start from when no checkpoint exists
    #[serde(default)]
    pub start_cursor: Option<i64>,

    /// Minimum cursor advance before a new checkpoint is written
    #[serde(default = "default_cursor_threshold")]
    pub cursor_threshold: i64,

    /// Checkpoints older than this are pruned on each write
    #[serde(default = "default_cursor_retention_secs")]
    pub cursor_retention_secs: u64,

    /// Delay between stream reconnection attempts
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Maximum stream reconnection attempts (0 = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Timeout for XRPC and embed requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// oEmbed endpoint used on embed cache misses
    #[serde(default = "default_embed_endpoint")]
    pub embed_endpoint: String,

    /// Label values a proposal may carry
    #[serde(default = "default_allowed_labels")]
    pub allowed_labels: Vec<String>,

    /// Accounts admitted without an allow-user proposal
    #[serde(default)]
    pub bootstrap_allowed: Vec<String>,

    /// Run a backfill pass before consuming the stream
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,
}

fn default_db_file() -> String {
    "ledger.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_publish_mode() -> PublishMode {
    PublishMode::Offline
}

fn default_pds_url() -> String {
    "https://bsky.social".to_string()
}

fn default_appview_url() -> String {
    "https://public.api.bsky.app".to_string()
}

fn default_jetstream_url() -> String {
    "wss://jetstream2.us-east.bsky.network/subscribe".to_string()
}

fn default_cursor_threshold() -> i64 {
    1_000_000
}

fn default_cursor_retention_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_embed_endpoint() -> String {
    "https://embed.bsky.app/oembed".to_string()
}

pub fn default_allowed_labels() -> Vec<String> {
    ["wholesome", "helpful", "banger", "needs-context"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_file: default_db_file(),
            log_level: default_log_level(),
            publish_mode: default_publish_mode(),
            service_did: String::new(),
            service_identifier: String::new(),
            service_password: String::new(),
            pds_url: default_pds_url(),
            appview_url: default_appview_url(),
            jetstream_url: default_jetstream_url(),
            start_cursor: None,
            cursor_threshold: default_cursor_threshold(),
            cursor_retention_secs: default_cursor_retention_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: 0,
            request_timeout_secs: default_request_timeout_secs(),
            embed_endpoint: default_embed_endpoint(),
            allowed_labels: default_allowed_labels(),
            bootstrap_allowed: Vec::new(),
            backfill_on_start: true,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Check settings that the live mode cannot run without
    pub fn validate(&self) -> Result<(), crate::LedgerError> {
        if self.publish_mode == PublishMode::Live {
            if self.service_did.is_empty() {
                return Err(crate::LedgerError::Config("service_did is required in live mode".into()));
            }
            if self.service_identifier.is_empty() || self.service_password.is_empty() {
                return Err(crate::LedgerError::Config(
                    "service_identifier and service_password are required in live mode".into(),
                ));
            }
        }
        if self.cursor_threshold < 0 {
            return Err(crate::LedgerError::Config("cursor_threshold must be >= 0".into()));
        }
        Ok(())
    }

    /// Get database path, `None` for an in-memory database
    pub fn db_path(&self) -> Option<PathBuf> {
        if self.db_file == ":memory:" {
            None
        } else {
            Some(self.data_dir.join(&self.db_file))
        }
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Repository that proposals and votes are written to
    pub fn repo_account(&self) -> &str {
        if self.service_did.is_empty() {
            OFFLINE_ACCOUNT
        } else {
            &self.service_did
        }
    }

    pub fn cursor_retention(&self) -> Duration {
        Duration::from_secs(self.cursor_retention_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
publish_mode = "live"
service_did = "did:plc:service"
cursor_threshold = 500
"#,
        )
        .unwrap();

        assert_eq!(config.publish_mode, PublishMode::Live);
        assert_eq!(config.cursor_threshold, 500);
        assert_eq!(config.cursor_retention_secs, 10);
        assert_eq!(config.allowed_labels, default_allowed_labels());
        assert!(config.backfill_on_start);
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let config = Config {
            publish_mode: PublishMode::Live,
            service_did: "did:plc:service".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_password_not_saved() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            service_password: "hunter2".into(),
            ..Config::default()
        };
        config.save(config.config_path()).unwrap();

        let written = std::fs::read_to_string(config.config_path()).unwrap();
        assert!(!written.contains("hunter2"));

        let loaded = Config::load(config.config_path()).unwrap();
        assert!(loaded.service_password.is_empty());
        assert_eq!(loaded.data_dir, dir.path());
    }

    #[test]
    fn test_memory_db_path() {
        let config = Config {
            db_file: ":memory:".into(),
            ..Config::default()
        };
        assert!(config.db_path().is_none());
    }
}
