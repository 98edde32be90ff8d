// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis hash-backed target store.
//!
//! ```text
//! <prefix>docs   HASH  id → JSON body (with "_rev")
//! <prefix>revs   HASH  id → write generation
//! ```
//!
//! A bulk write is two pipelines: `HINCRBY` on the revision counters, then
//! `HSET` of the bodies with the new `_rev` embedded. Documents without a
//! string `_id` fail individually and never reach Redis.

use super::{body_bytes, revision, TargetStore, WriteOutcome};
use crate::change::{document_id, Document, REV_FIELD};
use crate::config::TargetConfig;
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::resilience::{retry, RetryConfig};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Redis implementation of [`TargetStore`].
pub struct RedisTarget {
    config: TargetConfig,
    retry: RetryConfig,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisTarget {
    pub fn new(config: TargetConfig) -> Self {
        Self {
            config,
            retry: RetryConfig::startup(),
            conn: RwLock::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn docs_key(&self) -> String {
        format!("{}docs", self.config.key_prefix())
    }

    fn revs_key(&self) -> String {
        format!("{}revs", self.config.key_prefix())
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| ReplicationError::target(&self.config.database, "not connected"))
    }

    /// Read back a stored document.
    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(self.docs_key(), id)
            .await
            .map_err(|e| ReplicationError::redis("HGET", e))?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| ReplicationError::target(&self.config.database, format!("corrupt document {}: {}", id, e)))
        })
        .transpose()
    }

    async fn write_batch(&self, docs: Vec<Document>) -> Result<Vec<WriteOutcome>> {
        let mut conn = self.connection().await?;
        let started = Instant::now();

        // Split out documents that cannot be written at all
        let mut outcomes: Vec<Option<WriteOutcome>> = Vec::with_capacity(docs.len());
        let mut writable: Vec<(usize, String, Document)> = Vec::new();
        for (index, doc) in docs.into_iter().enumerate() {
            match document_id(&doc).map(str::to_string) {
                Some(id) if doc.is_object() => {
                    outcomes.push(None);
                    writable.push((index, id, doc));
                }
                id => outcomes.push(Some(WriteOutcome::failed(
                    id,
                    "document must be an object with a string _id",
                ))),
            }
        }

        if !writable.is_empty() {
            let mut incr = ::redis::pipe();
            for (_, id, _) in &writable {
                incr.hincr(self.revs_key(), id, 1i64);
            }
            let generations: Vec<i64> = incr
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::target(&self.config.database, format!("HINCRBY failed: {}", e)))?;

            let mut set = ::redis::pipe();
            let mut written = Vec::with_capacity(writable.len());
            for ((index, id, mut doc), generation) in writable.into_iter().zip(generations) {
                let rev = revision(generation.max(1) as u64, &body_bytes(&doc));
                if let Value::Object(map) = &mut doc {
                    map.insert(REV_FIELD.to_string(), Value::String(rev.clone()));
                }
                let body = serde_json::to_string(&doc)
                    .map_err(|e| ReplicationError::Internal(format!("serialize {}: {}", id, e)))?;
                set.hset(self.docs_key(), &id, body).ignore();
                written.push((index, id, rev));
            }
            let _: () = set
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::target(&self.config.database, format!("HSET failed: {}", e)))?;

            for (index, id, rev) in written {
                outcomes[index] = Some(WriteOutcome::ok(id, rev));
            }
        }

        debug!(
            database = %self.config.database,
            count = outcomes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bulk write complete"
        );

        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| WriteOutcome::failed(None, "not written")))
            .collect())
    }
}

impl TargetStore for RedisTarget {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(database = %self.config.database, url = %self.config.url, "Connecting to target");
            let client = Client::open(self.config.url.as_str())
                .map_err(|e| ReplicationError::Config(format!("Invalid target URL: {}", e)))?;

            let conn = retry(&self.retry, "target_connect", || async {
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| ReplicationError::redis("connect", e))
            })
            .await?;

            *self.conn.write().await = Some(conn);
            info!(database = %self.config.database, "Connected to target");
            Ok(())
        })
    }

    fn database_name(&self) -> &str {
        &self.config.database
    }

    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>> {
        Box::pin(self.write_batch(docs))
    }
}
