// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch writer.
//!
//! A single worker task drains a queue of batches, so at most one bulk write
//! is in flight per target and checkpoint advancement needs no coordination.
//!
//! ```text
//! enqueue(batch) ──▶ queue ──▶ worker ──▶ bulk_write ──▶ outcomes
//!                                │                         │
//!                                │     checkpoint_candidate ◀┘
//!                                ▼
//!                      save(max(prev, candidate))
//! ```
//!
//! # Outcomes
//!
//! | Result of the bulk write        | Counters          | Checkpoint    | Batch result      |
//! |---------------------------------|-------------------|---------------|-------------------|
//! | every document confirmed        | copied += n       | advanced      | `Ok`              |
//! | some documents rejected         | copied, failed    | confirmed set | `Err(PartialWrite)` |
//! | call failed (transport)         | failed += n       | unchanged     | `Err(Target)`     |
//! | checkpoint save failed          | copied, failed    | unchanged     | `Err(..)`         |

use crate::change::Document;
use crate::checkpoint::{record_event_logged, CheckpointRepository, EventType};
use crate::config::{BatchSettings, CheckpointPolicy};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::sequence::Sequence;
use crate::stats::StatsHandle;
use crate::target::{TargetStore, WriteOutcome};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// One admitted document and the sequence it arrived at.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub seq: Sequence,
    pub doc: Document,
}

impl BatchEntry {
    pub fn new(seq: impl Into<Sequence>, doc: Document) -> Self {
        Self { seq: seq.into(), doc }
    }
}

/// Result of a batch whose documents were all confirmed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub size: usize,
    pub copied: usize,
    /// Checkpoint persisted after this batch.
    pub checkpoint: Option<Sequence>,
}

/// Pick the checkpoint candidate for a written batch.
///
/// `seqs` and `outcomes` are index-aligned and in receipt order, so the
/// candidate is chosen by position rather than by comparing tokens. A missing
/// outcome counts as a failure.
pub fn checkpoint_candidate(
    seqs: &[Sequence],
    outcomes: &[WriteOutcome],
    policy: CheckpointPolicy,
) -> Option<Sequence> {
    let succeeded = |i: usize| outcomes.get(i).is_some_and(WriteOutcome::is_success);

    match policy {
        CheckpointPolicy::Contiguous => seqs
            .iter()
            .enumerate()
            .take_while(|(i, _)| succeeded(*i))
            .last()
            .map(|(_, seq)| seq.clone()),
        CheckpointPolicy::HighestSuccess => seqs
            .iter()
            .enumerate()
            .rev()
            .find(|(i, _)| succeeded(*i))
            .map(|(_, seq)| seq.clone()),
    }
}

struct Job {
    batch: Vec<BatchEntry>,
    reply: oneshot::Sender<Result<BatchOutcome>>,
}

/// Handle to the writer task.
pub struct BatchWriter {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<watch::Sender<usize>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Start the worker.
    ///
    /// `initial` is the checkpoint loaded at startup. Persisted checkpoints
    /// never go below it.
    pub fn spawn(
        target: Arc<dyn TargetStore>,
        checkpoints: Arc<dyn CheckpointRepository>,
        stats: StatsHandle,
        task_id: String,
        settings: BatchSettings,
        initial: Option<Sequence>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);

        let span = info_span!("batch_writer", task_id = %task_id);
        let worker = Worker {
            target,
            checkpoints,
            stats,
            task_id,
            settings,
            last_checkpoint: initial,
            pending: Arc::clone(&pending),
        };
        let task = tokio::spawn(worker.run(rx).instrument(span));

        Self {
            tx,
            pending,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a batch. The returned receiver resolves when the batch is done.
    pub fn enqueue(&self, batch: Vec<BatchEntry>) -> Result<oneshot::Receiver<Result<BatchOutcome>>> {
        let (reply, rx) = oneshot::channel();
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(Job { batch, reply }).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(ReplicationError::Shutdown);
        }
        metrics::set_pending_batches(self.pending());
        Ok(rx)
    }

    /// Queued plus in-flight batches.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until every queued batch has resolved. `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.pending.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Stop the worker after the queue empties.
    pub async fn close(&self, timeout: Duration) {
        if !self.drain(timeout).await {
            warn!(pending = self.pending(), "Writer did not drain before timeout");
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

struct Worker {
    target: Arc<dyn TargetStore>,
    checkpoints: Arc<dyn CheckpointRepository>,
    stats: StatsHandle,
    task_id: String,
    settings: BatchSettings,
    last_checkpoint: Option<Sequence>,
    pending: Arc<watch::Sender<usize>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        debug!("Batch writer started");
        while let Some(Job { batch, reply }) = rx.recv().await {
            let result = self.process(batch).await;
            if let Err(e) = &result {
                metrics::record_error("writer", e.kind());
            }
            // Receiver may be gone; completion is informational
            let _ = reply.send(result);
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            metrics::set_pending_batches(*self.pending.borrow());
        }
        debug!("Batch writer stopped");
    }

    async fn process(&mut self, batch: Vec<BatchEntry>) -> Result<BatchOutcome> {
        let size = batch.len();
        if size == 0 {
            return Ok(BatchOutcome {
                checkpoint: self.last_checkpoint.clone(),
                ..Default::default()
            });
        }

        let started = Instant::now();
        let (seqs, docs): (Vec<Sequence>, Vec<Document>) =
            batch.into_iter().map(|e| (e.seq, e.doc)).unzip();
        let first_seq = seqs.first().cloned().unwrap_or_default();
        let last_seq = seqs.last().cloned().unwrap_or_default();

        let outcomes = match self.target.bulk_write(docs).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.stats.record_failed(size as u64);
                metrics::record_batch_transport_failure(size);
                warn!(
                    batch_size = size,
                    first_seq = %first_seq,
                    last_seq = %last_seq,
                    error = %e,
                    "Bulk write failed"
                );
                record_event_logged(
                    self.checkpoints.as_ref(),
                    &self.task_id,
                    EventType::Error,
                    json!({
                        "stage": "bulk_write",
                        "error": e.to_string(),
                        "batch_size": size,
                        "first_seq": first_seq,
                        "last_seq": last_seq,
                    }),
                )
                .await;
                return Err(e);
            }
        };

        let mut copied = 0usize;
        let mut errors = Vec::new();
        for (index, seq) in seqs.iter().enumerate() {
            match outcomes.get(index) {
                Some(outcome) if outcome.is_success() => copied += 1,
                outcome => {
                    let id = outcome.and_then(|o| o.id.clone());
                    let reason = outcome
                        .and_then(|o| o.error.clone())
                        .unwrap_or_else(|| "no revision returned".to_string());
                    record_event_logged(
                        self.checkpoints.as_ref(),
                        &self.task_id,
                        EventType::Error,
                        json!({
                            "stage": "document_write",
                            "seq": seq,
                            "id": id,
                            "error": reason,
                        }),
                    )
                    .await;
                    errors.push(format!("{}: {}", id.as_deref().unwrap_or("<unknown>"), reason));
                }
            }
        }
        let failed = errors.len();

        self.stats.record_copied(copied as u64);
        self.stats.record_failed(failed as u64);
        metrics::record_batch_write(size, copied, failed, started.elapsed());

        let candidate = checkpoint_candidate(&seqs, &outcomes, self.settings.checkpoint_policy);
        let checkpoint = match candidate {
            Some(candidate) => Some(self.persist(candidate).await?),
            None => self.last_checkpoint.clone(),
        };

        if failed > 0 {
            warn!(
                batch_size = size,
                copied,
                failed,
                checkpoint = ?checkpoint,
                "Batch partially written"
            );
            return Err(ReplicationError::PartialWrite {
                failed,
                total: size,
                first_error: errors.swap_remove(0),
            });
        }

        debug!(
            batch_size = size,
            checkpoint = ?checkpoint,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch written"
        );
        Ok(BatchOutcome {
            size,
            copied,
            checkpoint,
        })
    }

    /// Save `max(previous, candidate)`, retrying revision conflicts.
    async fn persist(&mut self, candidate: Sequence) -> Result<Sequence> {
        let next = match &self.last_checkpoint {
            Some(prev) if *prev >= candidate => prev.clone(),
            _ => candidate,
        };

        let mut attempt = 0u32;
        loop {
            match self.checkpoints.save(&self.task_id, &next, Utc::now()).await {
                Ok(saved) => {
                    self.stats.record_applied(&saved.last_seq, saved.last_applied_at).await;
                    self.last_checkpoint = Some(saved.last_seq.clone());
                    return Ok(saved.last_seq);
                }
                Err(e @ ReplicationError::Conflict { .. }) if attempt < self.settings.checkpoint_retries => {
                    attempt += 1;
                    metrics::record_checkpoint_conflict();
                    info!(seq = %next, attempt, error = %e, "Checkpoint conflict, retrying");
                    record_event_logged(
                        self.checkpoints.as_ref(),
                        &self.task_id,
                        EventType::Retry,
                        json!({ "stage": "checkpoint", "seq": next, "attempt": attempt }),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(seq = %next, error = %e, "Checkpoint save failed");
                    record_event_logged(
                        self.checkpoints.as_ref(),
                        &self.task_id,
                        EventType::Error,
                        json!({ "stage": "checkpoint", "seq": next, "error": e.to_string() }),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }
}
