// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory pipeline fixtures.

use feed_replicator::checkpoint::{CheckpointRepository, EventRecord, SqliteCheckpointStore};
use feed_replicator::source::MemorySource;
use feed_replicator::target::MemoryTarget;
use feed_replicator::{Replicator, ReplicatorConfig, Result, Sequence};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for any single pipeline test step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Memory source and target plus a file-backed checkpoint store.
pub struct Pipeline {
    pub source: MemorySource,
    pub target: MemoryTarget,
    pub store: Arc<SqliteCheckpointStore>,
    pub config: ReplicatorConfig,
    _dir: TempDir,
}

impl Pipeline {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoints.db");
        let store = SqliteCheckpointStore::open(&path, true).await.expect("open store");

        let mut config = ReplicatorConfig::for_testing("orders", "orders-copy");
        config.checkpoint.sqlite_path = path.to_string_lossy().to_string();

        Self {
            source: MemorySource::new("orders"),
            target: MemoryTarget::new("orders-copy"),
            store: Arc::new(store),
            config,
            _dir: dir,
        }
    }

    /// Build a replicator over this pipeline's source, target and store.
    pub fn replicator(&self) -> Replicator {
        Replicator::new(
            self.config.clone(),
            Arc::new(self.source.clone()),
            Arc::new(self.target.clone()),
            self.store.clone(),
        )
    }

    pub fn task_id(&self) -> String {
        self.config.task_id()
    }

    /// Persisted checkpoint sequence.
    pub async fn checkpoint(&self) -> Option<Sequence> {
        self.store
            .load(&self.task_id())
            .await
            .expect("load checkpoint")
            .map(|c| c.last_seq)
    }

    /// Recorded events, oldest first.
    pub async fn events(&self) -> Vec<EventRecord> {
        self.store.events(&self.task_id(), 1000).await.expect("read events")
    }
}

/// Start a replicator and wait for it to stop on its own.
pub async fn run_to_completion(replicator: &mut Replicator) -> Result<()> {
    replicator.start().await?;
    tokio::time::timeout(STEP_TIMEOUT, replicator.run())
        .await
        .expect("replicator did not stop in time")
}

/// Poll `condition` until it holds or the step timeout expires.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
