// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests and
//! to write change entries the way an upstream producer would.

use redis::AsyncCommands;
use sha2::Digest;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container acting as the source and/or target database.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append a raw entry to a change stream.
    pub async fn add_entry(&self, stream_key: &str, fields: &[(&str, &[u8])]) -> redis::RedisResult<String> {
        let mut conn = self.conn().await?;
        conn.xadd(stream_key, "*", fields).await
    }

    /// Append a document write, with its content hash.
    pub async fn add_put(&self, stream_key: &str, id: &str, json: &str) -> redis::RedisResult<String> {
        let hash = hex::encode(sha2::Sha256::digest(json.as_bytes()));
        self.add_entry(
            stream_key,
            &[
                ("op", "PUT".as_bytes()),
                ("id", id.as_bytes()),
                ("doc", json.as_bytes()),
                ("hash", hash.as_bytes()),
            ],
        )
        .await
    }

    /// Append a zstd-compressed document write.
    pub async fn add_compressed_put(&self, stream_key: &str, id: &str, json: &str) -> redis::RedisResult<String> {
        let hash = hex::encode(sha2::Sha256::digest(json.as_bytes()));
        let compressed = zstd::encode_all(json.as_bytes(), 3).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::ClientError, "zstd", e.to_string()))
        })?;
        self.add_entry(
            stream_key,
            &[
                ("op", "PUT".as_bytes()),
                ("id", id.as_bytes()),
                ("doc", compressed.as_slice()),
                ("hash", hash.as_bytes()),
            ],
        )
        .await
    }

    /// Append a deletion without a tombstone body.
    pub async fn add_delete(&self, stream_key: &str, id: &str) -> redis::RedisResult<String> {
        self.add_entry(stream_key, &[("op", "DEL".as_bytes()), ("id", id.as_bytes())]).await
    }

    /// Register an upstream selector under `<stream>:filters`.
    pub async fn register_filter(&self, stream_key: &str, name: &str, selector: &str) -> redis::RedisResult<()> {
        let mut conn = self.conn().await?;
        conn.hset(format!("{}:filters", stream_key), name, selector).await
    }

    /// Read a stored target document.
    pub async fn target_doc(&self, key_prefix: &str, id: &str) -> redis::RedisResult<Option<serde_json::Value>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(format!("{}docs", key_prefix), id).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    /// Number of stored target documents.
    pub async fn target_len(&self, key_prefix: &str) -> redis::RedisResult<usize> {
        let mut conn = self.conn().await?;
        conn.hlen(format!("{}docs", key_prefix)).await
    }
}
