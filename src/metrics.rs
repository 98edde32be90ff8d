//! Metrics for observability.
//!
//! Emits metrics through the `metrics` facade for:
//! - Change feed consumption (received, filtered, feed events)
//! - Batch writes (copied, failed, size, latency)
//! - Checkpoint persistence
//! - Backpressure and idle-flush state
//!
//! No exporter is installed here. Whoever embeds the replicator picks one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use feed_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the feed controller after receiving a change
//! metrics::record_notifications_received(1);
//!
//! // In the batch writer after a bulk write
//! metrics::record_batch_write(100, 98, 2, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record change notifications delivered by the source.
pub fn record_notifications_received(count: usize) {
    counter!("replication_notifications_received_total").increment(count as u64);
}

/// Record change notifications rejected by the filter stage.
pub fn record_notifications_filtered(count: usize) {
    counter!("replication_notifications_filtered_total").increment(count as u64);
}

/// Record a stream-layer event from the source (error, timeout, retry, inactive, stop).
pub fn record_feed_event(kind: &str) {
    counter!("replication_feed_events_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for the feed controller state.
pub fn set_feed_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Starting" => 0.0,
        "Active" => 1.0,
        "Paused" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_feed_state").set(value);
}

/// Gauge for the replicator lifecycle state.
pub fn set_replicator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "ConnectingSource" => 1.0,
        "ConnectingTarget" => 2.0,
        "LoadingFilters" => 3.0,
        "LoadingTransform" => 4.0,
        "Subscribing" => 5.0,
        "Active" => 6.0,
        "Stopped" => 7.0,
        "Failed" => 8.0,
        _ => -1.0,
    };
    gauge!("replication_state").set(value);
}

/// Gauge for queued plus in-flight batches.
pub fn set_pending_batches(count: usize) {
    gauge!("replication_pending_batches").set(count as f64);
}

/// Gauge for the current idle-flush interval.
pub fn set_idle_flush_interval(interval: Duration) {
    gauge!("replication_idle_flush_interval_seconds").set(interval.as_secs_f64());
}

/// Record a backpressure transition (pause or resume).
pub fn record_backpressure(action: &str) {
    counter!("replication_backpressure_transitions_total", "action" => action.to_string()).increment(1);
}

// =============================================================================
// Batch Write Metrics
// =============================================================================

/// Record a completed bulk write with per-document outcomes.
pub fn record_batch_write(size: usize, copied: usize, failed: usize, duration: Duration) {
    counter!("replication_documents_copied_total").increment(copied as u64);
    if failed > 0 {
        counter!("replication_documents_failed_total").increment(failed as u64);
    }
    histogram!("replication_batch_size").record(size as f64);
    histogram!("replication_batch_write_duration_seconds").record(duration.as_secs_f64());
}

/// Record a bulk write that failed as a whole.
pub fn record_batch_transport_failure(size: usize) {
    counter!("replication_batch_transport_failures_total").increment(1);
    counter!("replication_documents_failed_total").increment(size as u64);
}

/// Record an idle flush of a partial batch.
pub fn record_idle_flush(size: usize) {
    counter!("replication_idle_flushes_total").increment(1);
    histogram!("replication_idle_flush_size").record(size as f64);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record checkpoint persistence.
pub fn record_checkpoint_save(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_checkpoint_saves_total", "status" => status).increment(1);
}

/// Record a checkpoint conflict that was retried.
pub fn record_checkpoint_conflict() {
    counter!("replication_checkpoint_conflicts_total").increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_checkpoint_retry(operation: &str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Transport Metrics
// =============================================================================

/// Record stream read result.
pub fn record_stream_read(events_count: usize, duration: Duration) {
    counter!("replication_stream_reads_total").increment(1);
    if events_count > 0 {
        counter!("replication_stream_events_read_total").increment(events_count as u64);
    }
    histogram!("replication_stream_read_duration_seconds").record(duration.as_secs_f64());
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
