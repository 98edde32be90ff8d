// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence and the replication event log.
//!
//! One checkpoint record per task holds the last sequence whose document was
//! confirmed written to the target. On restart the feed resumes from it.
//!
//! ```text
//! batch written → checkpoint saved (seq 1234)
//!                 (crash here = resume from 1234, docs after it re-read)
//! ```
//!
//! # Optimistic Versioning
//!
//! Each record carries a revision. `save()` reads the current revision and
//! issues an update conditioned on it. A mismatch is reported as
//! [`ReplicationError::Conflict`], which is retryable. With a single writer
//! per task, conflicts only happen if two processes run the same task.
//!
//! # Event Log
//!
//! Start, stop, error, warning and retry events are appended to an
//! `events` table. Appends are fire-and-forget: callers use
//! [`record_event_logged`], which logs failures instead of propagating them.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Those errors are retried with capped exponential backoff.

use crate::error::{BoxFuture, ReplicationError, Result};
use crate::sequence::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_checkpoint_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persisted resume state for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    /// Last sequence whose document was confirmed written
    pub last_seq: Sequence,
    /// Time of the last successful batch write
    pub last_applied_at: DateTime<Utc>,
    /// Optimistic concurrency revision
    pub revision: i64,
}

/// Kind of entry in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Error,
    Warning,
    Retry,
    Stop,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Error => "error",
            EventType::Warning => "warning",
            EventType::Retry => "retry",
            EventType::Stop => "stop",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(EventType::Start),
            "error" => Ok(EventType::Error),
            "warning" => Ok(EventType::Warning),
            "retry" => Ok(EventType::Retry),
            "stop" => Ok(EventType::Stop),
            other => Err(ReplicationError::Internal(format!("Unknown event type '{}'", other))),
        }
    }
}

/// One entry of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub task_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// What the replicator needs from checkpoint storage.
pub trait CheckpointRepository: Send + Sync + 'static {
    /// Load the checkpoint for a task. `None` on first run.
    fn load(&self, task_id: &str) -> BoxFuture<'_, Option<Checkpoint>>;

    /// Upsert the checkpoint, conditioned on the current revision.
    fn save(
        &self,
        task_id: &str,
        last_seq: &Sequence,
        last_applied_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Checkpoint>;

    /// Append an event to the log.
    fn record_event(&self, task_id: &str, event_type: EventType, payload: Value) -> BoxFuture<'_, ()>;
}

/// Append an event, logging instead of propagating failures.
pub async fn record_event_logged<C: CheckpointRepository + ?Sized>(
    repo: &C,
    task_id: &str,
    event_type: EventType,
    payload: Value,
) {
    if let Err(e) = repo.record_event(task_id, event_type, payload).await {
        warn!(task_id = %task_id, event = %event_type, error = %e, "Failed to record event");
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Checkpoint store backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    path: String,
    initialized: OnceCell<()>,
}

impl SqliteCheckpointStore {
    /// Open (and create if missing) the store at `path`.
    ///
    /// `":memory:"` gives a private in-memory database.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening checkpoint store");

        let in_memory = path_str == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if wal_mode && !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Every pooled connection to :memory: would be its own database
        let max_connections = if in_memory { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: path_str,
            initialized: OnceCell::new(),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Create tables and indexes. Runs at most once per store.
    async fn initialize(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS checkpoints (
                        task_id TEXT PRIMARY KEY,
                        last_seq TEXT NOT NULL,
                        last_applied_at INTEGER NOT NULL,
                        revision INTEGER NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS events (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id TEXT NOT NULL,
                        event_type TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        created_at INTEGER NOT NULL
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query("CREATE INDEX IF NOT EXISTS events_by_task ON events (task_id, id)")
                    .execute(&self.pool)
                    .await?;

                debug!(path = %self.path, "Checkpoint store initialized");
                Ok::<(), ReplicationError>(())
            })
            .await?;
        Ok(())
    }

    async fn load_inner(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let pool = &self.pool;
        let row: Option<(String, i64, i64)> = execute_with_retry("checkpoint_load", || async {
            sqlx::query_as(
                "SELECT last_seq, last_applied_at, revision FROM checkpoints WHERE task_id = ?",
            )
            .bind(task_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(row.map(|(last_seq, applied_ms, revision)| Checkpoint {
            task_id: task_id.to_string(),
            last_seq: Sequence::new(last_seq),
            last_applied_at: millis_to_datetime(applied_ms),
            revision,
        }))
    }

    async fn save_inner(
        &self,
        task_id: &str,
        last_seq: &Sequence,
        last_applied_at: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let pool = &self.pool;
        let applied_ms = last_applied_at.timestamp_millis();
        let current = self.load_inner(task_id).await?;

        let revision = match current {
            None => {
                let inserted = execute_with_retry("checkpoint_insert", || async {
                    sqlx::query(
                        "INSERT INTO checkpoints (task_id, last_seq, last_applied_at, revision) VALUES (?, ?, ?, 1)",
                    )
                    .bind(task_id)
                    .bind(last_seq.as_str())
                    .bind(applied_ms)
                    .execute(pool)
                    .await
                })
                .await;

                match inserted {
                    Ok(_) => 1,
                    Err(e) if is_unique_violation(&e) => {
                        return Err(ReplicationError::Conflict {
                            task_id: task_id.to_string(),
                            expected: 0,
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(existing) => {
                let result = execute_with_retry("checkpoint_update", || async {
                    sqlx::query(
                        r#"
                        UPDATE checkpoints
                        SET last_seq = ?, last_applied_at = ?, revision = revision + 1
                        WHERE task_id = ? AND revision = ?
                        "#,
                    )
                    .bind(last_seq.as_str())
                    .bind(applied_ms)
                    .bind(task_id)
                    .bind(existing.revision)
                    .execute(pool)
                    .await
                })
                .await?;

                if result.rows_affected() == 0 {
                    return Err(ReplicationError::Conflict {
                        task_id: task_id.to_string(),
                        expected: existing.revision,
                    });
                }
                existing.revision + 1
            }
        };

        crate::metrics::record_checkpoint_save(true);
        debug!(task_id = %task_id, seq = %last_seq, revision, "Checkpoint saved");

        Ok(Checkpoint {
            task_id: task_id.to_string(),
            last_seq: last_seq.clone(),
            last_applied_at: millis_to_datetime(applied_ms),
            revision,
        })
    }

    async fn record_event_inner(&self, task_id: &str, event_type: EventType, payload: Value) -> Result<()> {
        let pool = &self.pool;
        let payload = payload.to_string();
        let now = Utc::now().timestamp_millis();

        execute_with_retry("event_append", || async {
            sqlx::query(
                "INSERT INTO events (task_id, event_type, payload, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(task_id)
            .bind(event_type.as_str())
            .bind(&payload)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        Ok(())
    }

    /// Most recent events for a task, oldest first.
    pub async fn events(&self, task_id: &str, limit: u32) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, event_type, payload, created_at
            FROM events WHERE task_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            let event_type: String = row.try_get("event_type")?;
            let payload: String = row.try_get("payload")?;
            events.push(EventRecord {
                id: row.try_get("id")?,
                task_id: row.try_get("task_id")?,
                event_type: event_type.parse()?,
                payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
                created_at: millis_to_datetime(row.try_get("created_at")?),
            });
        }
        Ok(events)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool, checkpointing the WAL first.
    pub async fn close(&self) {
        let pool = &self.pool;
        if let Err(e) = execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointRepository for SqliteCheckpointStore {
    fn load(&self, task_id: &str) -> BoxFuture<'_, Option<Checkpoint>> {
        let task_id = task_id.to_string();
        Box::pin(async move { self.load_inner(&task_id).await })
    }

    fn save(
        &self,
        task_id: &str,
        last_seq: &Sequence,
        last_applied_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Checkpoint> {
        let task_id = task_id.to_string();
        let last_seq = last_seq.clone();
        Box::pin(async move {
            let result = self.save_inner(&task_id, &last_seq, last_applied_at).await;
            if result.is_err() {
                crate::metrics::record_checkpoint_save(false);
            }
            result
        })
    }

    fn record_event(&self, task_id: &str, event_type: EventType, payload: Value) -> BoxFuture<'_, ()> {
        let task_id = task_id.to_string();
        Box::pin(async move { self.record_event_inner(&task_id, event_type, payload).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        assert!(store.load("task-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        let now = Utc::now();

        let saved = store.save("task-a", &Sequence::from(12), now).await.unwrap();
        assert_eq!(saved.revision, 1);

        let loaded = store.load("task-a").await.unwrap().unwrap();
        assert_eq!(loaded.last_seq, Sequence::from(12));
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.last_applied_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_save_bumps_revision() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        store.save("task-a", &Sequence::from(1), Utc::now()).await.unwrap();
        store.save("task-a", &Sequence::from(2), Utc::now()).await.unwrap();
        let third = store.save("task-a", &Sequence::from(3), Utc::now()).await.unwrap();
        assert_eq!(third.revision, 3);
        assert_eq!(store.load("task-a").await.unwrap().unwrap().last_seq, Sequence::from(3));
    }

    #[tokio::test]
    async fn test_tasks_are_independent() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        store.save("task-a", &Sequence::from(5), Utc::now()).await.unwrap();
        store.save("task-b", &Sequence::from(9), Utc::now()).await.unwrap();
        assert_eq!(store.load("task-a").await.unwrap().unwrap().last_seq, Sequence::from(5));
        assert_eq!(store.load("task-b").await.unwrap().unwrap().last_seq, Sequence::from(9));
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("checkpoints.db");

        {
            let store = SqliteCheckpointStore::open(&db_path, true).await.unwrap();
            store.save("task-a", &Sequence::from("1700000000000-4"), Utc::now()).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteCheckpointStore::open(&db_path, true).await.unwrap();
            let loaded = store.load("task-a").await.unwrap().unwrap();
            assert_eq!(loaded.last_seq, Sequence::from("1700000000000-4"));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflict() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("conflict.db");
        let store = SqliteCheckpointStore::open(&db_path, true).await.unwrap();
        store.save("task-a", &Sequence::from(1), Utc::now()).await.unwrap();

        // Another writer bumps the revision behind our back
        sqlx::query("UPDATE checkpoints SET revision = revision + 1 WHERE task_id = ?")
            .bind("task-a")
            .execute(&store.pool)
            .await
            .unwrap();

        // The conditioned update still wins because save() re-reads the revision
        let saved = store.save("task-a", &Sequence::from(2), Utc::now()).await.unwrap();
        assert_eq!(saved.revision, 3);
        store.close().await;
    }

    #[tokio::test]
    async fn test_events_append_and_read() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        store.record_event("task-a", EventType::Start, json!({"since": "0"})).await.unwrap();
        store.record_event("task-a", EventType::Error, json!({"message": "boom"})).await.unwrap();
        store.record_event("task-b", EventType::Stop, json!(null)).await.unwrap();

        let events = store.events("task-a", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Start);
        assert_eq!(events[1].event_type, EventType::Error);
        assert_eq!(events[1].payload["message"], "boom");
    }

    #[tokio::test]
    async fn test_events_limit_keeps_latest() {
        let store = SqliteCheckpointStore::open(":memory:", false).await.unwrap();
        for i in 0..5 {
            store.record_event("task-a", EventType::Retry, json!({"attempt": i})).await.unwrap();
        }
        let events = store.events("task-a", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["attempt"], 3);
        assert_eq!(events[1].payload["attempt"], 4);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("twice.db");
        let first = SqliteCheckpointStore::open(&db_path, true).await.unwrap();
        let second = SqliteCheckpointStore::open(&db_path, true).await.unwrap();
        first.save("task-a", &Sequence::from(3), Utc::now()).await.unwrap();
        assert!(second.load("task-a").await.unwrap().is_some());
        first.initialize().await.unwrap();
        first.close().await;
        second.close().await;
    }

    #[test]
    fn test_event_type_roundtrip() {
        for t in [EventType::Start, EventType::Error, EventType::Warning, EventType::Retry, EventType::Stop] {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("paused".parse::<EventType>().is_err());
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }
}
