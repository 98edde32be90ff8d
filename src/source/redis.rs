// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stream change feed.
//!
//! Tails `<database>:changes` (or the configured stream key) with
//! `XREAD BLOCK`. Each stream entry is one change:
//!
//! | Field  | Required      | Meaning                                     |
//! |--------|---------------|---------------------------------------------|
//! | `op`   | yes           | `PUT` or `DEL`                              |
//! | `id`   | yes           | Document identifier                         |
//! | `doc`  | PUT only      | JSON body, optionally zstd-compressed       |
//! | `hash` | no            | Hex SHA-256 of the decompressed body        |
//!
//! The stream entry ID is the change's [`Sequence`](crate::sequence::Sequence).
//!
//! # Upstream Filters
//!
//! Named filters are JSON [`Selector`]s stored in the hash
//! `<stream>:filters`, field `group/name`. They are evaluated here, before a
//! change is delivered.
//!
//! # Disruptions
//!
//! - Read error: `Error`, then `Retry` with daemon backoff. The connection
//!   manager reconnects underneath.
//! - Read slower than the request timeout: `Timeout`.
//! - No entries for the inactivity window: `Inactive` (once per quiet period).
//!
//! Entries that fail to parse (bad op, corrupt payload, hash mismatch) are
//! skipped and reported as `Error`.

use super::{wait_until_resumed, FeedControl, FeedEvent, FeedOptions, FeedSubscription, SourceFeed, FEED_CHANNEL_CAPACITY};
use crate::change::{decode_document, ChangeNotification};
use crate::config::SourceConfig;
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::filter::{FilterName, Selector};
use crate::metrics;
use crate::resilience::{retry, RetryConfig};
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, trace, warn};

/// Change operation carried by a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Put,
    Delete,
}

impl ChangeOp {
    fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PUT" => Some(ChangeOp::Put),
            "DEL" | "DELETE" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

type RawEntry = (String, HashMap<String, Value>);

/// Redis Streams implementation of [`SourceFeed`].
pub struct RedisSource {
    config: SourceConfig,
    connect_retry: RetryConfig,
    feed_retry: RetryConfig,
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            connect_retry: RetryConfig::startup(),
            feed_retry: RetryConfig::daemon(),
            conn: RwLock::new(None),
        }
    }

    /// Override the retry policies (initial connect, live feed).
    pub fn with_retry(mut self, connect: RetryConfig, feed: RetryConfig) -> Self {
        self.connect_retry = connect;
        self.feed_retry = feed;
        self
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| ReplicationError::source(&self.config.database, "not connected"))
    }
}

impl SourceFeed for RedisSource {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(database = %self.config.database, url = %self.config.url, "Connecting to source");
            let client = Client::open(self.config.url.as_str())
                .map_err(|e| ReplicationError::Config(format!("Invalid source URL: {}", e)))?;

            let conn = retry(&self.connect_retry, "source_connect", || async {
                client
                    .get_connection_manager()
                    .await
                    .map_err(|e| ReplicationError::redis("connect", e))
            })
            .await?;

            *self.conn.write().await = Some(conn);
            info!(database = %self.config.database, "Connected to source");
            Ok(())
        })
    }

    fn database_name(&self) -> &str {
        &self.config.database
    }

    fn resolve_filter(&self, name: &FilterName) -> BoxFuture<'_, Option<String>> {
        let field = name.to_string();
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let definition: Option<String> = conn
                .hget(self.config.filters_key(), &field)
                .await
                .map_err(|e| ReplicationError::redis("HGET", e))?;
            Ok(definition)
        })
    }

    fn subscribe(&self, options: FeedOptions) -> BoxFuture<'_, FeedSubscription> {
        Box::pin(async move {
            let selector = match &options.filter {
                None => None,
                Some(name) => {
                    let definition = self.resolve_filter(name).await?.ok_or_else(|| {
                        ReplicationError::Config(format!("Upstream filter '{}' not found", name))
                    })?;
                    Some(Selector::parse(&definition)?)
                }
            };

            let conn = self.connection().await?;
            let tailer = StreamTailer {
                database: self.config.database.clone(),
                stream_key: self.config.stream_key(),
                block_timeout: self.config.block_timeout_duration(),
                request_timeout: self.config.request_timeout_duration(),
                inactivity_timeout: self.config.inactivity_timeout_duration(),
                read_count: self.config.read_count,
                retry: self.feed_retry.clone(),
            };

            info!(
                database = %tailer.database,
                stream = %tailer.stream_key,
                since = %options.since,
                "Subscribing to change stream"
            );

            let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
            let (control, paused) = FeedControl::new();
            let task = tokio::spawn(tailer.run(conn, options, selector, tx, paused));
            Ok(FeedSubscription::new(rx, control, Some(task)))
        })
    }
}

/// Reads one stream and forwards parsed changes.
struct StreamTailer {
    database: String,
    stream_key: String,
    block_timeout: Duration,
    request_timeout: Duration,
    inactivity_timeout: Duration,
    read_count: usize,
    retry: RetryConfig,
}

impl StreamTailer {
    async fn run(
        self,
        mut conn: ConnectionManager,
        options: FeedOptions,
        selector: Option<Selector>,
        tx: mpsc::Sender<FeedEvent>,
        mut paused: watch::Receiver<bool>,
    ) {
        let mut cursor = options.since.as_str().to_string();
        let mut last_data = Instant::now();
        let mut inactive_reported = false;
        let mut failures = 0usize;

        loop {
            if !wait_until_resumed(&mut paused).await {
                return;
            }

            let started = Instant::now();
            let read = tokio::time::timeout(self.request_timeout, self.read_entries(&mut conn, &cursor)).await;

            match read {
                Err(_) => {
                    debug!(database = %self.database, cursor = %cursor, "Stream read timed out");
                    if tx.send(FeedEvent::Timeout).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    metrics::record_error("source", e.kind());
                    warn!(database = %self.database, attempt = failures, error = %e, "Stream read failed");
                    if tx.send(FeedEvent::Error(e.to_string())).await.is_err() {
                        return;
                    }
                    if failures >= self.retry.max_attempts {
                        let _ = tx.send(FeedEvent::Stop).await;
                        return;
                    }
                    let delay = self.retry.delay_for_attempt(failures);
                    if tx.send(FeedEvent::Retry { attempt: failures, delay }).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = tx.closed() => return,
                    }
                }
                Ok(Ok(entries)) => {
                    failures = 0;
                    metrics::record_stream_read(entries.len(), started.elapsed());

                    if entries.is_empty() {
                        if !inactive_reported && last_data.elapsed() >= self.inactivity_timeout {
                            inactive_reported = true;
                            if tx.send(FeedEvent::Inactive).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }

                    last_data = Instant::now();
                    inactive_reported = false;

                    for (id, fields) in entries {
                        cursor = id.clone();
                        let event = match parse_entry(&id, &fields) {
                            Ok(change) => {
                                if let Some(selector) = &selector {
                                    if !selector.matches_change(&change) {
                                        trace!(seq = %change.seq, id = %change.id, "Upstream filter rejected change");
                                        continue;
                                    }
                                }
                                let mut change = change;
                                if !options.include_docs {
                                    change.doc = None;
                                }
                                FeedEvent::Change(change)
                            }
                            Err(e) => {
                                warn!(
                                    database = %self.database,
                                    stream_id = %id,
                                    error = %e,
                                    "Failed to parse stream entry, skipping"
                                );
                                FeedEvent::Error(format!("entry {}: {}", id, e))
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// XREAD BLOCK timeout COUNT n STREAMS key cursor
    async fn read_entries(&self, conn: &mut ConnectionManager, cursor: &str) -> Result<Vec<RawEntry>> {
        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.read_count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[cursor], &opts)
            .await
            .map_err(|e| ReplicationError::redis("XREAD", e))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| (entry.id, entry.map))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Parse one stream entry into a change notification.
pub fn parse_entry(stream_id: &str, fields: &HashMap<String, Value>) -> Result<ChangeNotification> {
    let op_str = get_string_field(fields, "op")?;
    let op = ChangeOp::parse(&op_str)
        .ok_or_else(|| ReplicationError::StreamParse(format!("Unknown op type: {}", op_str)))?;
    let id = get_string_field(fields, "id")?;
    let hash = get_string_field(fields, "hash").ok();

    match op {
        ChangeOp::Put => {
            let raw = get_bytes_field(fields, "doc")?;
            let doc = decode_document(&raw, hash.as_deref())?;
            Ok(ChangeNotification::new(stream_id, id, doc))
        }
        ChangeOp::Delete => {
            let tombstone = match fields.get("doc") {
                Some(_) => Some(decode_document(&get_bytes_field(fields, "doc")?, hash.as_deref())?),
                None => None,
            };
            Ok(ChangeNotification::deletion(stream_id, id, tombstone))
        }
    }
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| ReplicationError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone())
            .map_err(|e| ReplicationError::StreamParse(format!("Invalid UTF-8 in {}: {}", name, e))),
        Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(ReplicationError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| ReplicationError::StreamParse(format!("Missing field: {}", name)))?;

    match value {
        Value::BulkString(bytes) => Ok(bytes.clone()),
        Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(ReplicationError::StreamParse(format!(
            "Unexpected type for field {}: {:?}",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::content_hash;
    use crate::sequence::Sequence;

    fn fields<const N: usize>(pairs: [(&str, &[u8]); N]) -> HashMap<String, Value> {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::BulkString(v.to_vec())))
            .collect()
    }

    #[test]
    fn test_change_op_parse() {
        assert_eq!(ChangeOp::parse("PUT"), Some(ChangeOp::Put));
        assert_eq!(ChangeOp::parse("put"), Some(ChangeOp::Put));
        assert_eq!(ChangeOp::parse("DEL"), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::parse("DELETE"), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::parse("PATCH"), None);
    }

    #[test]
    fn test_parse_put_entry() {
        let body = br#"{"_id":"order-1","total":5}"#;
        let hash = content_hash(body);
        let entry = fields([("op", b"PUT"), ("id", b"order-1"), ("doc", body), ("hash", hash.as_bytes())]);

        let change = parse_entry("1700000000000-0", &entry).unwrap();
        assert_eq!(change.seq, Sequence::from("1700000000000-0"));
        assert_eq!(change.id, "order-1");
        assert!(!change.deleted);
        assert_eq!(change.doc.unwrap()["total"], 5);
    }

    #[test]
    fn test_parse_compressed_put_entry() {
        let body = br#"{"_id":"order-2"}"#;
        let compressed = zstd::encode_all(&body[..], 3).unwrap();
        let entry = fields([("op", b"PUT"), ("id", b"order-2"), ("doc", &compressed)]);
        let change = parse_entry("5-1", &entry).unwrap();
        assert_eq!(change.doc.unwrap()["_id"], "order-2");
    }

    #[test]
    fn test_parse_delete_entry() {
        let entry = fields([("op", b"DEL"), ("id", b"order-3")]);
        let change = parse_entry("6-0", &entry).unwrap();
        assert!(change.deleted);
        assert!(change.doc.is_none());

        let with_tombstone = fields([("op", b"DEL"), ("id", b"order-3"), ("doc", br#"{"_deleted":true}"#)]);
        let change = parse_entry("7-0", &with_tombstone).unwrap();
        assert!(change.deleted);
        assert!(change.has_valid_body());
    }

    #[test]
    fn test_parse_entry_hash_mismatch() {
        let entry = fields([("op", b"PUT"), ("id", b"x"), ("doc", b"{}"), ("hash", b"deadbeef")]);
        assert!(matches!(parse_entry("1-0", &entry), Err(ReplicationError::StreamParse(_))));
    }

    #[test]
    fn test_parse_entry_missing_fields() {
        assert!(parse_entry("1-0", &fields([("id", b"x")])).is_err());
        assert!(parse_entry("1-0", &fields([("op", b"PUT"), ("id", b"x")])).is_err());
        assert!(parse_entry("1-0", &fields([("op", b"NOPE"), ("id", b"x")])).is_err());
    }

    #[test]
    fn test_get_string_field_simple_and_invalid() {
        let mut entry = HashMap::new();
        entry.insert("op".to_string(), Value::SimpleString("PUT".to_string()));
        entry.insert("bad".to_string(), Value::BulkString(vec![0xFF, 0xFE]));
        entry.insert("num".to_string(), Value::Int(3));
        assert_eq!(get_string_field(&entry, "op").unwrap(), "PUT");
        assert!(get_string_field(&entry, "bad").is_err());
        assert!(get_string_field(&entry, "num").is_err());
        assert_eq!(get_bytes_field(&entry, "op").unwrap(), b"PUT");
    }

    #[tokio::test]
    async fn test_not_connected() {
        let source = RedisSource::new(SourceConfig::for_testing("redis://127.0.0.1:1", "orders"));
        let err = source.resolve_filter(&FilterName::new("app", "x")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Source { .. }));
        assert_eq!(source.database_name(), "orders");
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let source = RedisSource::new(SourceConfig::for_testing("not a url", "orders"))
            .with_retry(RetryConfig::testing(), RetryConfig::testing());
        assert!(matches!(source.connect().await, Err(ReplicationError::Config(_))));
    }
}
