//! # Feed Replicator
//!
//! Continuous, checkpointed replication of documents from a source change
//! feed to a target store, with optional filtering and transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             feed-replicator                              │
//! │                                                                          │
//! │  ┌────────────┐   ┌─────────────────┐   ┌──────────┐   ┌──────────────┐  │
//! │  │ SourceFeed │──►│ FeedController  │──►│ Filter + │──►│ BatchWriter  │  │
//! │  │ (subscribe)│   │ (select! loop)  │   │ Transform│   │ (1 worker)   │  │
//! │  └────────────┘   └─────────────────┘   └──────────┘   └──────────────┘  │
//! │        ▲            │ pause/resume                        │        │     │
//! │        └────────────┘ idle flush                          ▼        ▼     │
//! │                                              ┌─────────────┐ ┌─────────┐ │
//! │                                              │ TargetStore │ │Checkpts │ │
//! │                                              │ (bulk write)│ │(SQLite) │ │
//! │                                              └─────────────┘ └─────────┘ │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - At-least-once: a restart from a checkpoint never skips a change after it.
//! - The persisted checkpoint never moves backwards.
//! - At most one bulk write is in flight per target.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use feed_replicator::{Replicator, ReplicatorConfig, SqliteCheckpointStore};
//! use feed_replicator::source::RedisSource;
//! use feed_replicator::target::RedisTarget;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> feed_replicator::Result<()> {
//!     let config = ReplicatorConfig::default();
//!     let checkpoints = SqliteCheckpointStore::open(&config.checkpoint.sqlite_path, true).await?;
//!
//!     let mut replicator = Replicator::new(
//!         config.clone(),
//!         Arc::new(RedisSource::new(config.source.clone())),
//!         Arc::new(RedisTarget::new(config.target.clone())),
//!         Arc::new(checkpoints),
//!     );
//!     replicator.start().await?;
//!     replicator.run().await
//! }
//! ```

pub mod change;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod resilience;
pub mod sequence;
pub mod source;
pub mod stats;
pub mod status;
pub mod target;
pub mod transform;
pub mod writer;

// Re-exports for convenience
pub use change::{ChangeNotification, Document};
pub use checkpoint::{Checkpoint, CheckpointRepository, EventRecord, EventType, SqliteCheckpointStore};
pub use config::{CheckpointPolicy, ReplicationSettings, ReplicatorConfig, SourceConfig, TargetConfig};
pub use coordinator::{FeedState, Replicator, ReplicatorState, ShutdownHandle};
pub use error::{ReplicationError, Result};
pub use filter::{ChangePredicate, FilterName, FilterStage};
pub use sequence::Sequence;
pub use source::{FeedEvent, FeedOptions, SourceFeed};
pub use stats::{ReplicationStats, StatsHandle};
pub use status::StatusSnapshot;
pub use target::{TargetStore, WriteOutcome};
pub use transform::{DocumentTransform, TransformStage};
pub use writer::{BatchEntry, BatchOutcome, BatchWriter};
