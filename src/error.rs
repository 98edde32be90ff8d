// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by their source (Redis, SQLite, target store, user
//! routines) and carry enough context to debug a failed run.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Redis` | Yes | No | Network errors, timeouts, connection failures |
//! | `Source` | Yes | No | Change feed unavailable |
//! | `Target` | Yes | No | Bulk write call failed as a whole |
//! | `Conflict` | Yes | No | Checkpoint revision mismatch (optimistic concurrency) |
//! | `CheckpointStore` | No | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Yes | Configuration invalid or unresolvable |
//! | `Transform` | No | Yes | Transform routine failed |
//! | `Decompression` | No | No | Payload corrupt (zstd decode failed) |
//! | `StreamParse` | No | No | Malformed change entry |
//! | `InvalidState` | No | No | Engine state machine violation |
//! | `Shutdown` | No | No | Engine is shutting down |
//! | `Internal` | No | No | Unexpected internal error |
//!
//! # Fatal Errors
//!
//! [`ReplicationError::is_fatal()`] marks the errors that must stop the
//! whole process. Configuration errors can only occur at startup. Transform
//! errors can occur at any time and halt the pipeline immediately.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Boxed future returned by the collaborator traits (source, target, checkpoints).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Boxed error returned by user-supplied filter and transform routines.
pub type RoutineError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the checkpoint store.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// The checkpoint record changed underneath us.
    ///
    /// Raised by the conditioned update when the stored revision does not
    /// match the one we read. The single-writer design makes this rare.
    #[error("Checkpoint conflict for task {task_id}: expected revision {expected}")]
    Conflict { task_id: String, expected: i64 },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source change feed failure.
    #[error("Source error ({database}): {message}")]
    Source { database: String, message: String },

    /// Target bulk write failed as a whole. No document in the call is confirmed.
    #[error("Target error ({database}): {message}")]
    Target { database: String, message: String },

    /// Some documents of a batch were rejected by the target.
    ///
    /// The confirmed subset has already been checkpointed when this is returned.
    #[error("Batch partially failed: {failed} of {total} documents not written ({first_error})")]
    PartialWrite {
        failed: usize,
        total: usize,
        first_error: String,
    },

    /// Transform routine raised an error. Always fatal.
    #[error("Transform '{routine}' failed on document {doc_id}: {message}")]
    Transform {
        routine: String,
        doc_id: String,
        message: String,
    },

    /// Zstd decompression failure.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Change stream entry parsing failure.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a target transport error.
    pub fn target(database: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Target {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Create a source feed error.
    pub fn source(database: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::Source { .. } => true,
            Self::Target { .. } => true,
            Self::Conflict { .. } => true,
            Self::CheckpointStore(_) => false,
            Self::PartialWrite { .. } => false,
            Self::Config(_) => false,
            Self::Transform { .. } => false,
            Self::Decompression(_) => false,
            Self::StreamParse(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Transform { .. })
    }

    /// Short label for metrics and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Redis { .. } => "redis",
            Self::CheckpointStore(_) => "checkpoint_store",
            Self::Conflict { .. } => "conflict",
            Self::Config(_) => "config",
            Self::Source { .. } => "source",
            Self::Target { .. } => "target",
            Self::PartialWrite { .. } => "partial_write",
            Self::Transform { .. } => "transform",
            Self::Decompression(_) => "decompression",
            Self::StreamParse(_) => "stream_parse",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let err = ReplicationError::redis_msg("XREAD", "connection reset");
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("XREAD"));
    }

    #[test]
    fn test_is_retryable_target() {
        let err = ReplicationError::target("orders-copy", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("orders-copy"));
    }

    #[test]
    fn test_is_retryable_conflict() {
        let err = ReplicationError::Conflict {
            task_id: "abc".to_string(),
            expected: 3,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("revision 3"));
    }

    #[test]
    fn test_config_is_fatal() {
        let err = ReplicationError::Config("unknown filter 'app/missing'".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transform_is_fatal() {
        let err = ReplicationError::Transform {
            routine: "drop-fields".to_string(),
            doc_id: "order-7".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("drop-fields"));
        assert!(msg.contains("order-7"));
    }

    #[test]
    fn test_not_fatal_stream_parse() {
        let err = ReplicationError::StreamParse("missing op field".to_string());
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = ReplicationError::InvalidState {
            expected: "Created".to_string(),
            actual: "Active".to_string(),
        };
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Active"));
    }

    #[test]
    fn test_partial_write_not_retryable() {
        let err = ReplicationError::PartialWrite {
            failed: 1,
            total: 2,
            first_error: "b: forbidden".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("1 of 2"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ReplicationError::Shutdown.kind(), "shutdown");
        assert_eq!(ReplicationError::source("db", "down").kind(), "source");
        assert_eq!(ReplicationError::Internal("x".into()).kind(), "internal");
    }
}
