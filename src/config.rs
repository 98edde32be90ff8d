//! Configuration for the replicator.
//!
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use feed_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig::for_testing("orders", "orders-copy");
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── source: SourceConfig          # Change feed location and read timeouts
//! ├── target: TargetConfig          # Where documents are written
//! ├── checkpoint: CheckpointConfig  # SQLite checkpoint persistence
//! ├── settings: ReplicationSettings
//! │   ├── batch: BatchSettings      # Batch size, checkpoint policy
//! │   ├── backpressure: BackpressureConfig
//! │   ├── idle_flush: IdleFlushConfig
//! │   └── drain_timeout             # Bound on the graceful drain
//! ├── filter: FilterConfig          # Upstream "group/name" + local routine
//! ├── transform: Option<String>     # Built-in transform routine
//! └── restart: bool                 # Ignore the stored checkpoint
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "source": { "url": "redis://src:6379", "database": "orders" },
//!   "target": { "url": "redis://dst:6379", "database": "orders-copy" },
//!   "checkpoint": { "sqlite_path": "/var/lib/replicator/checkpoints.db" },
//!   "settings": {
//!     "batch": { "batch_size": 500, "checkpoint_policy": "contiguous" },
//!     "backpressure": { "check_interval": "10s", "max_pending_batches": 50 },
//!     "idle_flush": { "base_interval": "60s" }
//!   },
//!   "filter": { "server": "app/by_region", "client": "skip-deleted" },
//!   "transform": "drop-fields:internal_notes"
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::filter::FilterName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Replicator::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    pub source: SourceConfig,

    pub target: TargetConfig,

    /// Checkpoint persistence settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub settings: ReplicationSettings,

    #[serde(default)]
    pub filter: FilterConfig,

    /// Built-in transform routine (e.g. `"drop-fields:a,b"`).
    #[serde(default)]
    pub transform: Option<String>,

    /// Start from the beginning of the feed, ignoring the stored checkpoint.
    #[serde(default)]
    pub restart: bool,
}

impl ReplicatorConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(source_db: &str, target_db: &str) -> Self {
        Self {
            source: SourceConfig::for_testing("memory://source", source_db),
            target: TargetConfig::for_testing("memory://target", target_db),
            checkpoint: CheckpointConfig::in_memory(),
            settings: ReplicationSettings::default(),
            filter: FilterConfig::default(),
            transform: None,
            restart: false,
        }
    }

    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ReplicationError::Config(format!("Invalid config: {}", e)))
    }

    /// Check everything that can be checked without talking to the source.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(ReplicationError::Config("source.url is required".into()));
        }
        if self.source.database.trim().is_empty() {
            return Err(ReplicationError::Config("source.database is required".into()));
        }
        if self.target.url.trim().is_empty() {
            return Err(ReplicationError::Config("target.url is required".into()));
        }
        if self.target.database.trim().is_empty() {
            return Err(ReplicationError::Config("target.database is required".into()));
        }
        if self.settings.batch.batch_size == 0 {
            return Err(ReplicationError::Config("settings.batch.batch_size must be > 0".into()));
        }
        if self.source.read_count == 0 {
            return Err(ReplicationError::Config("source.read_count must be > 0".into()));
        }
        if self.settings.backpressure.check_interval_duration().is_zero() {
            return Err(ReplicationError::Config(
                "settings.backpressure.check_interval must be > 0".into(),
            ));
        }
        if self.settings.idle_flush.base_interval_duration().is_zero() {
            return Err(ReplicationError::Config(
                "settings.idle_flush.base_interval must be > 0".into(),
            ));
        }
        if self.settings.idle_flush.max_backoff > MAX_IDLE_BACKOFF {
            return Err(ReplicationError::Config(format!(
                "settings.idle_flush.max_backoff must be <= {}",
                MAX_IDLE_BACKOFF
            )));
        }
        self.filter.server_name()?;
        Ok(())
    }

    /// Stable identifier for this source/target pair.
    ///
    /// Hex SHA-256 of `"<source url>/<source db>|<target url>/<target db>"`.
    pub fn task_id(&self) -> String {
        use sha2::{Digest, Sha256};
        let key = format!(
            "{}/{}|{}/{}",
            self.source.url, self.source.database, self.target.url, self.target.database
        );
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: change feed
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the change feed comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source URL. Example: `"redis://source.example.com:6379"`
    pub url: String,

    /// Source database name.
    pub database: String,

    /// Stream key override. Defaults to `"<database>:changes"`.
    #[serde(default)]
    pub stream_key: Option<String>,

    /// XREAD block timeout as a duration string (e.g., "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// A read taking longer than this produces a timeout event.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// No data for this long produces an inactive event.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout: String,

    /// Maximum entries per XREAD call.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_inactivity_timeout() -> String {
    "5m".to_string()
}

fn default_read_count() -> usize {
    100
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: String::new(),
            stream_key: None,
            block_timeout: default_block_timeout(),
            request_timeout: default_request_timeout(),
            inactivity_timeout: default_inactivity_timeout(),
            read_count: default_read_count(),
        }
    }
}

impl SourceConfig {
    pub fn for_testing(url: &str, database: &str) -> Self {
        Self {
            url: url.to_string(),
            database: database.to_string(),
            block_timeout: "100ms".to_string(),
            request_timeout: "2s".to_string(),
            inactivity_timeout: "10s".to_string(),
            ..Default::default()
        }
    }

    /// Effective stream key.
    pub fn stream_key(&self) -> String {
        self.stream_key
            .clone()
            .unwrap_or_else(|| format!("{}:changes", self.database))
    }

    /// Key of the hash holding upstream filter selectors.
    pub fn filters_key(&self) -> String {
        format!("{}:filters", self.stream_key())
    }

    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.request_timeout, Duration::from_secs(30))
    }

    pub fn inactivity_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.inactivity_timeout, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TargetConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Where documents are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target URL. Example: `"redis://target.example.com:6379"`
    pub url: String,

    /// Target database name.
    pub database: String,

    /// Key prefix override. Defaults to `"<database>:"`.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            database: String::new(),
            key_prefix: None,
        }
    }
}

impl TargetConfig {
    pub fn for_testing(url: &str, database: &str) -> Self {
        Self {
            url: url.to_string(),
            database: database.to_string(),
            key_prefix: None,
        }
    }

    /// Effective key prefix.
    pub fn key_prefix(&self) -> String {
        self.key_prefix
            .clone()
            .unwrap_or_else(|| format!("{}:", self.database))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: batching, backpressure, idle flush
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub idle_flush: IdleFlushConfig,

    /// Bound on flushing and draining the writer at shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_drain_timeout() -> String {
    "30s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            backpressure: BackpressureConfig::default(),
            idle_flush: IdleFlushConfig::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReplicationSettings {
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.drain_timeout, Duration::from_secs(30))
    }
}

/// How the checkpoint candidate is chosen from a batch with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Advance only across a prefix of successes. A failed document is never
    /// skipped over, so a restart re-reads it.
    #[default]
    Contiguous,
    /// Advance to the highest success in the batch, even past failures.
    HighestSuccess,
}

/// Batch writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Maximum documents per bulk write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,

    /// Retries for a checkpoint save that hit a revision conflict.
    #[serde(default = "default_checkpoint_retries")]
    pub checkpoint_retries: u32,
}

fn default_batch_size() -> usize {
    500
}

fn default_checkpoint_retries() -> u32 {
    3
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_policy: CheckpointPolicy::default(),
            checkpoint_retries: default_checkpoint_retries(),
        }
    }
}

/// Backpressure against the writer's queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// How often the pending count is checked.
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Pause the feed while more batches than this are pending.
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: usize,
}

fn default_check_interval() -> String {
    "10s".to_string()
}

fn default_max_pending_batches() -> usize {
    50
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            max_pending_batches: default_max_pending_batches(),
        }
    }
}

impl BackpressureConfig {
    pub fn check_interval_duration(&self) -> Duration {
        parse_duration_or(&self.check_interval, Duration::from_secs(10))
    }
}

/// Upper bound for [`IdleFlushConfig::max_backoff`]: the idle interval never
/// exceeds base × 64.
pub const MAX_IDLE_BACKOFF: u32 = 6;

/// Idle flush timer.
///
/// Interval = base × 2^backoff, where backoff grows by one per consecutive
/// idle check up to `max_backoff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleFlushConfig {
    #[serde(default = "default_base_interval")]
    pub base_interval: String,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: u32,
}

fn default_base_interval() -> String {
    "60s".to_string()
}

fn default_max_backoff() -> u32 {
    MAX_IDLE_BACKOFF
}

impl Default for IdleFlushConfig {
    fn default() -> Self {
        Self {
            base_interval: default_base_interval(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl IdleFlushConfig {
    pub fn base_interval_duration(&self) -> Duration {
        parse_duration_or(&self.base_interval, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FilterConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter routines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Upstream filter registered in the source, as `"group/name"`.
    #[serde(default)]
    pub server: Option<String>,

    /// Built-in local predicate name.
    #[serde(default)]
    pub client: Option<String>,
}

impl FilterConfig {
    /// Parsed upstream filter name.
    pub fn server_name(&self) -> Result<Option<FilterName>> {
        self.server.as_deref().map(str::parse).transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replicator_checkpoints.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
