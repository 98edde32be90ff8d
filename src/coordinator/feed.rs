// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed controller: drives one subscription into the batch writer.
//!
//! One `tokio::select!` loop multiplexes:
//! 1. The shutdown signal
//! 2. Feed events (changes and stream-layer events)
//! 3. The idle flush timer
//! 4. The backpressure check
//!
//! Per change, in order: stamp received stats, filter, strip `_rev`,
//! transform, stage. A full staging buffer is enqueued without waiting.
//!
//! # Stopping
//!
//! Source stop, a closed channel and shutdown are graceful: the staging
//! buffer is flushed and the writer drained (bounded by the drain timeout).
//! A transform error is not: the loop exits with the error and nothing
//! further is written.

use super::flush::IdleFlush;
use super::types::FeedState;
use crate::change::ChangeNotification;
use crate::checkpoint::{record_event_logged, CheckpointRepository, EventType};
use crate::config::ReplicationSettings;
use crate::error::{ReplicationError, Result};
use crate::filter::FilterStage;
use crate::metrics;
use crate::source::{FeedEvent, FeedSubscription};
use crate::stats::StatsHandle;
use crate::transform::TransformStage;
use crate::writer::{BatchEntry, BatchWriter};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

enum StopReason {
    SourceStopped,
    ChannelClosed,
    Shutdown,
    Fatal(ReplicationError),
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::SourceStopped => "source_stopped",
            StopReason::ChannelClosed => "channel_closed",
            StopReason::Shutdown => "shutdown",
            StopReason::Fatal(_) => "fatal_error",
        }
    }
}

pub(crate) struct FeedController {
    pub task_id: String,
    pub subscription: FeedSubscription,
    pub filter: Arc<FilterStage>,
    pub transform: TransformStage,
    pub writer: Arc<BatchWriter>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub stats: StatsHandle,
    pub settings: ReplicationSettings,
    pub feed_state: Arc<watch::Sender<FeedState>>,
    pub shutdown: watch::Receiver<bool>,
}

impl FeedController {
    pub(crate) async fn run(self) -> Result<()> {
        let mut idle = IdleFlush::from_config(&self.settings.idle_flush);
        let mut state = LoopState {
            buffer: Vec::with_capacity(self.settings.batch.batch_size),
            idle_interval: idle.interval(),
        };
        let FeedController {
            task_id,
            mut subscription,
            filter,
            transform,
            writer,
            checkpoints,
            stats,
            settings,
            feed_state,
            mut shutdown,
        } = self;

        let ctx = Context {
            task_id,
            filter,
            transform,
            writer,
            checkpoints,
            stats,
            settings,
            feed_state,
        };

        ctx.set_feed_state(FeedState::Active);
        info!(
            batch_size = ctx.settings.batch.batch_size,
            idle_interval = ?state.idle_interval,
            "Feed controller running"
        );

        let idle_timer = tokio::time::sleep(state.idle_interval);
        tokio::pin!(idle_timer);

        let mut backpressure = tokio::time::interval(ctx.settings.backpressure.check_interval_duration());
        backpressure.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break StopReason::Shutdown;
                    }
                }

                event = subscription.events.recv() => match event {
                    None => {
                        warn!("Feed channel closed");
                        break StopReason::ChannelClosed;
                    }
                    Some(FeedEvent::Stop) => {
                        info!("Source stopped the feed");
                        break StopReason::SourceStopped;
                    }
                    Some(FeedEvent::Change(change)) => {
                        if let Err(e) = ctx.handle_change(&mut state, change).await {
                            break StopReason::Fatal(e);
                        }
                    }
                    Some(other) => ctx.handle_stream_event(other).await,
                },

                () = &mut idle_timer => {
                    let decision = idle.on_fire(state.buffer.is_empty(), ctx.writer.is_idle());
                    if decision.flush {
                        metrics::record_idle_flush(state.buffer.len());
                        debug!(buffered = state.buffer.len(), "Idle flush");
                        ctx.flush(&mut state);
                    }
                    state.idle_interval = decision.next;
                    metrics::set_idle_flush_interval(decision.next);
                    idle_timer.set(tokio::time::sleep(decision.next));
                }

                _ = backpressure.tick() => ctx.check_backpressure(&subscription),
            }
        };

        ctx.finish(&mut state, reason).await
    }
}

struct LoopState {
    buffer: Vec<BatchEntry>,
    idle_interval: std::time::Duration,
}

struct Context {
    task_id: String,
    filter: Arc<FilterStage>,
    transform: TransformStage,
    writer: Arc<BatchWriter>,
    checkpoints: Arc<dyn CheckpointRepository>,
    stats: StatsHandle,
    settings: ReplicationSettings,
    feed_state: Arc<watch::Sender<FeedState>>,
}

impl Context {
    fn set_feed_state(&self, state: FeedState) {
        self.feed_state.send_replace(state);
        metrics::set_feed_state(state.as_str());
    }

    async fn handle_change(&self, state: &mut LoopState, change: ChangeNotification) -> Result<()> {
        metrics::record_notifications_received(1);
        self.stats.record_received(&change.seq).await;

        if !self.filter.admit(&change) {
            self.stats.record_filtered();
            return Ok(());
        }

        let seq = change.seq.clone();
        let Some(doc) = change.into_admitted() else {
            return Ok(());
        };
        let doc = self.transform.apply(doc)?;

        state.buffer.push(BatchEntry { seq, doc });
        if state.buffer.len() >= self.settings.batch.batch_size {
            self.flush(state);
        }
        Ok(())
    }

    /// Enqueue the staging buffer. Completion is only logged.
    fn flush(&self, state: &mut LoopState) {
        if state.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.buffer);
        state.buffer.reserve(self.settings.batch.batch_size);
        let size = batch.len();
        let last_seq = batch.last().map(|e| e.seq.clone()).unwrap_or_default();

        match self.writer.enqueue(batch) {
            Ok(done) => {
                tokio::spawn(
                    async move {
                        match done.await {
                            Ok(Ok(outcome)) => debug!(
                                batch_size = size,
                                last_seq = %last_seq,
                                checkpoint = ?outcome.checkpoint,
                                "Batch complete"
                            ),
                            Ok(Err(e)) => warn!(
                                batch_size = size,
                                last_seq = %last_seq,
                                error = %e,
                                "Batch failed"
                            ),
                            Err(_) => debug!(batch_size = size, "Batch result dropped"),
                        }
                    }
                    .in_current_span(),
                );
            }
            Err(e) => warn!(batch_size = size, error = %e, "Writer unavailable, batch dropped"),
        }
    }

    async fn handle_stream_event(&self, event: FeedEvent) {
        metrics::record_feed_event(event.kind());
        let (event_type, payload) = match &event {
            FeedEvent::Error(message) => {
                warn!(error = %message, "Feed error");
                (EventType::Error, json!({ "stage": "feed", "error": message }))
            }
            FeedEvent::Timeout => {
                warn!("Feed request timed out");
                (EventType::Warning, json!({ "stage": "feed", "warning": "timeout" }))
            }
            FeedEvent::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "Feed retrying");
                (
                    EventType::Retry,
                    json!({ "stage": "feed", "attempt": attempt, "delay_ms": delay.as_millis() as u64 }),
                )
            }
            FeedEvent::Inactive => {
                info!("Feed inactive");
                (EventType::Warning, json!({ "stage": "feed", "warning": "inactive" }))
            }
            FeedEvent::Change(_) | FeedEvent::Stop => return,
        };
        record_event_logged(self.checkpoints.as_ref(), &self.task_id, event_type, payload).await;
    }

    /// Pause above the pending threshold, resume at or below it.
    fn check_backpressure(&self, subscription: &FeedSubscription) {
        let pending = self.writer.pending();
        let max = self.settings.backpressure.max_pending_batches;
        let paused = subscription.control.is_paused();

        if pending > max && !paused {
            subscription.control.pause();
            self.set_feed_state(FeedState::Paused);
            metrics::record_backpressure("pause");
            info!(pending, max, "Writer backlog high, pausing feed");
        } else if pending <= max && paused {
            subscription.control.resume();
            self.set_feed_state(FeedState::Active);
            metrics::record_backpressure("resume");
            info!(pending, max, "Writer backlog cleared, resuming feed");
        }
    }

    async fn finish(&self, state: &mut LoopState, reason: StopReason) -> Result<()> {
        let label = reason.as_str();

        if let StopReason::Fatal(e) = reason {
            error!(error = %e, dropped = state.buffer.len(), "Feed controller halted");
            metrics::record_error("feed", e.kind());
            record_event_logged(
                self.checkpoints.as_ref(),
                &self.task_id,
                EventType::Stop,
                json!({ "reason": label, "error": e.to_string() }),
            )
            .await;
            self.set_feed_state(FeedState::Stopped);
            return Err(e);
        }

        self.flush(state);
        let drain_timeout = self.settings.drain_timeout_duration();
        if !self.writer.drain(drain_timeout).await {
            warn!(
                pending = self.writer.pending(),
                timeout = ?drain_timeout,
                "Writer did not drain before timeout"
            );
        }

        record_event_logged(
            self.checkpoints.as_ref(),
            &self.task_id,
            EventType::Stop,
            json!({ "reason": label }),
        )
        .await;
        self.set_feed_state(FeedState::Stopped);
        info!(reason = label, "Feed controller stopped");
        Ok(())
    }
}
