// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator coordinator.
//!
//! Owns the pipeline for one source/target pair:
//! - Source feed via [`crate::source::SourceFeed`]
//! - Target store via [`crate::target::TargetStore`]
//! - Checkpoints and events via [`crate::checkpoint::CheckpointRepository`]
//! - The [`BatchWriter`] and the feed controller
//!
//! # Startup
//!
//! `start()` walks the initialization states in order. Each step either
//! succeeds and moves on, or sets `Failed` and returns its error:
//!
//! 1. `ConnectingSource`
//! 2. `ConnectingTarget`
//! 3. `LoadingFilters`: resolve the upstream filter, load the local predicate
//! 4. `LoadingTransform`
//! 5. `Subscribing`: load the checkpoint, seed stats, open the feed
//! 6. `Active`: the feed controller is running
//!
//! `run()` waits for the controller to stop. A transform error ends it with
//! `Failed`; everything else ends with `Stopped`.

mod feed;
mod flush;
mod types;

pub use flush::{IdleDecision, IdleFlush};
pub use types::{FeedState, ReplicatorState};

use crate::checkpoint::{record_event_logged, CheckpointRepository, EventType};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::filter::{builtin_predicate, ChangePredicate, FilterStage, UpstreamFilter};
use crate::metrics;
use crate::sequence::Sequence;
use crate::source::{FeedOptions, SourceFeed};
use crate::stats::StatsHandle;
use crate::status::{StatusParts, StatusSnapshot};
use crate::target::TargetStore;
use crate::transform::{builtin_transform, DocumentTransform, TransformStage};
use crate::writer::BatchWriter;
use feed::FeedController;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// Cloneable trigger for [`Replicator::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// One replication task.
pub struct Replicator {
    config: ReplicatorConfig,
    task_id: String,

    source: Arc<dyn SourceFeed>,
    target: Arc<dyn TargetStore>,
    checkpoints: Arc<dyn CheckpointRepository>,

    /// Injected routines take precedence over names in the config.
    predicate: Option<Arc<dyn ChangePredicate>>,
    transformer: Option<Arc<dyn DocumentTransform>>,

    state_tx: watch::Sender<ReplicatorState>,
    feed_state: Arc<watch::Sender<FeedState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,

    stats: StatsHandle,
    filter: Arc<FilterStage>,
    transform: TransformStage,
    writer: Option<Arc<BatchWriter>>,
    controller: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Replicator {
    /// Create a replicator in `Created` state.
    pub fn new(
        config: ReplicatorConfig,
        source: Arc<dyn SourceFeed>,
        target: Arc<dyn TargetStore>,
        checkpoints: Arc<dyn CheckpointRepository>,
    ) -> Self {
        let task_id = config.task_id();
        let (state_tx, _) = watch::channel(ReplicatorState::Created);
        let (feed_state, _) = watch::channel(FeedState::Starting);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            task_id,
            source,
            target,
            checkpoints,
            predicate: None,
            transformer: None,
            state_tx,
            feed_state: Arc::new(feed_state),
            shutdown_tx: Arc::new(shutdown_tx),
            stats: StatsHandle::new(),
            filter: Arc::new(FilterStage::pass_through()),
            transform: TransformStage::identity(),
            writer: None,
            controller: Mutex::new(None),
        }
    }

    /// Use this local predicate instead of `filter.client`.
    pub fn with_predicate(mut self, predicate: Arc<dyn ChangePredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Use this transform instead of `transform`.
    pub fn with_transform(mut self, transform: Arc<dyn DocumentTransform>) -> Self {
        self.transformer = Some(transform);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_tx.subscribe()
    }

    pub fn feed_state(&self) -> FeedState {
        *self.feed_state.borrow()
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    fn enter(&self, state: ReplicatorState) {
        self.state_tx.send_replace(state);
        metrics::set_replicator_state(state.as_str());
    }

    /// Run the startup sequence and spawn the feed controller.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != ReplicatorState::Created {
            return Err(ReplicationError::InvalidState {
                expected: ReplicatorState::Created.to_string(),
                actual: state.to_string(),
            });
        }

        info!(
            task_id = %self.task_id,
            source = %self.source.database_name(),
            target = %self.target.database_name(),
            restart = self.config.restart,
            "Starting replicator"
        );

        if let Err(e) = self.initialize().await {
            let step = self.state();
            error!(task_id = %self.task_id, step = %step, error = %e, "Replicator failed to start");
            metrics::record_error("startup", e.kind());
            record_event_logged(
                self.checkpoints.as_ref(),
                &self.task_id,
                EventType::Error,
                json!({ "stage": step.as_str(), "error": e.to_string() }),
            )
            .await;
            self.enter(ReplicatorState::Failed);
            return Err(e);
        }

        self.enter(ReplicatorState::Active);
        info!(task_id = %self.task_id, "Replicator active");
        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;

        self.enter(ReplicatorState::ConnectingSource);
        self.source.connect().await?;

        self.enter(ReplicatorState::ConnectingTarget);
        self.target.connect().await?;

        self.enter(ReplicatorState::LoadingFilters);
        let upstream = self.load_upstream_filter().await?;
        let local = match (&self.predicate, &self.config.filter.client) {
            (Some(predicate), _) => Some(Arc::clone(predicate)),
            (None, Some(name)) => Some(builtin_predicate(name)?),
            (None, None) => None,
        };
        self.filter = Arc::new(FilterStage::new(upstream, local));

        self.enter(ReplicatorState::LoadingTransform);
        let routine = match (&self.transformer, &self.config.transform) {
            (Some(transform), _) => Some(Arc::clone(transform)),
            (None, Some(name)) => Some(builtin_transform(name)?),
            (None, None) => None,
        };
        self.transform = TransformStage::new(routine);

        self.enter(ReplicatorState::Subscribing);
        self.subscribe().await
    }

    async fn load_upstream_filter(&self) -> Result<Option<UpstreamFilter>> {
        let Some(name) = self.config.filter.server_name()? else {
            return Ok(None);
        };
        match self.source.resolve_filter(&name).await? {
            Some(definition) => {
                info!(filter = %name, "Resolved upstream filter");
                Ok(Some(UpstreamFilter { name, definition }))
            }
            None => Err(ReplicationError::Config(format!(
                "Filter '{}' does not exist in source {}",
                name,
                self.source.database_name()
            ))),
        }
    }

    async fn subscribe(&mut self) -> Result<()> {
        let checkpoint = self.checkpoints.load(&self.task_id).await?;
        if let Some(checkpoint) = &checkpoint {
            self.stats.seed(checkpoint).await;
        }

        let since = match (&checkpoint, self.config.restart) {
            (Some(checkpoint), false) => checkpoint.last_seq.clone(),
            _ => Sequence::zero(),
        };
        info!(
            task_id = %self.task_id,
            since = %since,
            checkpoint = ?checkpoint.as_ref().map(|c| &c.last_seq),
            "Resuming replication"
        );

        let writer = Arc::new(BatchWriter::spawn(
            Arc::clone(&self.target),
            Arc::clone(&self.checkpoints),
            self.stats.clone(),
            self.task_id.clone(),
            self.config.settings.batch.clone(),
            checkpoint.map(|c| c.last_seq),
        ));
        self.writer = Some(Arc::clone(&writer));

        let options = FeedOptions {
            since: since.clone(),
            include_docs: true,
            filter: self.filter.upstream().map(|f| f.name.clone()),
        };
        let subscription = self.source.subscribe(options).await?;

        record_event_logged(
            self.checkpoints.as_ref(),
            &self.task_id,
            EventType::Start,
            json!({
                "since": since,
                "restart": self.config.restart,
                "source": self.source.database_name(),
                "target": self.target.database_name(),
            }),
        )
        .await;

        let controller = FeedController {
            task_id: self.task_id.clone(),
            subscription,
            filter: Arc::clone(&self.filter),
            transform: self.transform.clone(),
            writer,
            checkpoints: Arc::clone(&self.checkpoints),
            stats: self.stats.clone(),
            settings: self.config.settings.clone(),
            feed_state: Arc::clone(&self.feed_state),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let span = info_span!("feed_controller", task_id = %self.task_id);
        *self.controller.lock().await = Some(tokio::spawn(controller.run().instrument(span)));
        Ok(())
    }

    /// Wait for the feed controller to stop.
    pub async fn run(&self) -> Result<()> {
        let Some(handle) = self.controller.lock().await.take() else {
            return Err(ReplicationError::InvalidState {
                expected: ReplicatorState::Active.to_string(),
                actual: self.state().to_string(),
            });
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::Internal(format!("Feed controller panicked: {}", e))),
        };

        if let Some(writer) = &self.writer {
            writer.close(self.config.settings.drain_timeout_duration()).await;
        }

        match &result {
            Ok(()) => {
                self.enter(ReplicatorState::Stopped);
                info!(task_id = %self.task_id, "Replicator stopped");
            }
            Err(e) => {
                self.enter(ReplicatorState::Failed);
                error!(task_id = %self.task_id, error = %e, "Replicator failed");
            }
        }
        result
    }

    /// Ask the feed controller to stop. `run()` returns once it has drained.
    pub fn shutdown(&self) {
        info!(task_id = %self.task_id, "Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Snapshot for the status console.
    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot::build(StatusParts {
            task_id: &self.task_id,
            state: self.state().to_string(),
            feed: self.feed_state().to_string(),
            source_database: self.source.database_name(),
            target_database: self.target.database_name(),
            stats: self.stats.snapshot().await,
            filter: &self.filter,
            transform: &self.transform,
        })
    }
}
