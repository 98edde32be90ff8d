// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # feed-replicator
//!
//! Runs one replication task: Redis Streams source, Redis hash target,
//! SQLite checkpoints.
//!
//! ```bash
//! feed-replicator --config replicator.json
//! feed-replicator --config replicator.json --restart --log-format json
//! ```
//!
//! Exits 0 after a graceful stop (Ctrl-C or the source ending the feed) and
//! 1 on any fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feed_replicator::source::RedisSource;
use feed_replicator::target::RedisTarget;
use feed_replicator::{Replicator, ReplicatorConfig, SqliteCheckpointStore};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
    /// JSON structured logs (for production).
    Json,
}

/// Change-feed replicator.
#[derive(Debug, Parser)]
#[command(name = "feed-replicator")]
#[command(about = "Replicates documents from a change feed into a target store")]
#[command(version)]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "FEED_REPLICATOR_CONFIG")]
    config: PathBuf,

    /// Ignore the stored checkpoint and replay the feed from the start.
    #[arg(long, env = "FEED_REPLICATOR_RESTART")]
    restart: bool,

    /// Override the checkpoint database path.
    #[arg(long, env = "FEED_REPLICATOR_CHECKPOINT_PATH")]
    checkpoint_path: Option<String>,

    #[arg(long, env = "FEED_REPLICATOR_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,

    /// Log a JSON status snapshot this often (e.g. "30s"). Off when unset.
    #[arg(long, env = "FEED_REPLICATOR_STATUS_INTERVAL", value_parser = humantime::parse_duration)]
    status_interval: Option<Duration>,
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init(),
    }
}

fn load_config(args: &Args) -> Result<ReplicatorConfig> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let mut config = ReplicatorConfig::from_json(&raw)?;
    if args.restart {
        config.restart = true;
    }
    if let Some(path) = &args.checkpoint_path {
        config.checkpoint.sqlite_path = path.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    let checkpoints = Arc::new(
        SqliteCheckpointStore::open(&config.checkpoint.sqlite_path, config.checkpoint.wal_mode)
            .await
            .context("opening checkpoint store")?,
    );

    let mut replicator = Replicator::new(
        config.clone(),
        Arc::new(RedisSource::new(config.source.clone())),
        Arc::new(RedisTarget::new(config.target.clone())),
        checkpoints.clone(),
    );
    replicator.start().await?;

    let mut status_tick = args.status_interval.map(tokio::time::interval);
    let mut interrupted = false;

    let finished = replicator.run();
    tokio::pin!(finished);

    let result = loop {
        tokio::select! {
            result = &mut finished => break result,

            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                interrupted = true;
                replicator.shutdown();
            }

            _ = next_tick(&mut status_tick) => {
                let status = replicator.status().await;
                match serde_json::to_string(&status) {
                    Ok(json) => info!(status = %json, "Replication status"),
                    Err(e) => warn!(error = %e, "Failed to serialize status"),
                }
            }
        }
    };

    checkpoints.close().await;
    result.map_err(Into::into)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);

    info!(config = %args.config.display(), "Starting feed-replicator");
    match run(args).await {
        Ok(()) => {
            info!("feed-replicator stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "feed-replicator failed");
            ExitCode::FAILURE
        }
    }
}
