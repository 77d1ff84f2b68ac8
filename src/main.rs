//! Moderation ledger daemon
//!
//! Keeps the local materialized view of the service account's ledger current.
//!
//! ## Usage
//!
//! ```bash
//! # Follow the live ledger (backfill, then stream)
//! moderation-ledger --live run
//!
//! # One backfill pass, then exit
//! moderation-ledger --live backfill
//!
//! # Print table counts and the latest cursor
//! moderation-ledger stats
//! ```
//!
//! Service account credentials come from `SVC_ACT_DID`, `SVC_ACT_EMAIL` and
//! `SVC_ACT_APP_PW` when not given on the command line.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use moderation_ledger::config::default_data_dir;
use moderation_ledger::{Config, Engine, PublishMode};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "moderation-ledger")]
#[command(about = "Ledger sync and anonymous-voting engine for community moderation")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (database and default config location)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Database file path, overrides data_dir/db_file
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    /// Publish to the remote ledger and follow its stream
    #[arg(long)]
    live: bool,

    /// Service account DID
    #[arg(long, env = "SVC_ACT_DID")]
    service_did: Option<String>,

    /// Service account login identifier
    #[arg(long, env = "SVC_ACT_EMAIL")]
    service_identifier: Option<String>,

    /// Service account app password
    #[arg(long, env = "SVC_ACT_APP_PW", hide_env_values = true)]
    service_password: Option<String>,

    /// PDS base URL
    #[arg(long, env = "PDS_URL")]
    pds_url: Option<String>,

    /// Jetstream subscribe URL
    #[arg(long, env = "JETSTREAM_URL")]
    jetstream_url: Option<String>,

    /// Log level for this crate (RUST_LOG takes precedence)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Backfill, then follow the stream until interrupted
    Run,
    /// Run one backfill pass and exit
    Backfill,
    /// Print database statistics
    Stats,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let default_path = args
                .data_dir
                .clone()
                .unwrap_or_else(default_data_dir)
                .join("config.toml");
            if default_path.exists() {
                Config::load(&default_path)?
            } else {
                Config::default()
            }
        }
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(path) = &args.db_path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.data_dir = parent.to_path_buf();
        }
        if let Some(name) = path.file_name() {
            config.db_file = name.to_string_lossy().into_owned();
        }
    }
    if args.live {
        config.publish_mode = PublishMode::Live;
    }
    if let Some(did) = &args.service_did {
        config.service_did = did.clone();
    }
    if let Some(identifier) = &args.service_identifier {
        config.service_identifier = identifier.clone();
    }
    if let Some(password) = &args.service_password {
        config.service_password = password.clone();
    }
    if let Some(url) = &args.pds_url {
        config.pds_url = url.clone();
    }
    if let Some(url) = &args.jetstream_url {
        config.jetstream_url = url.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(format!("moderation_ledger={}", config.log_level)))?,
        )
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        publish_mode = ?config.publish_mode,
        account = %config.repo_account(),
        "Starting moderation-ledger"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let engine = Engine::from_config(config).context("Failed to start engine")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                    return;
                }
                info!("Shutdown requested");
                let _ = shutdown_tx.send(());
            });

            engine.start(shutdown_rx).await?;
        }
        Command::Backfill => {
            let report = engine.backfill().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.stats()?)?);
        }
    }

    info!("moderation-ledger stopped");
    Ok(())
}
