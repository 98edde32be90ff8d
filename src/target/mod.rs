// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target stores.
//!
//! A [`TargetStore`] accepts bulk writes and reports one [`WriteOutcome`]
//! per document, in input order. A call-level `Err` means no document in the
//! call is confirmed.
//!
//! The target assigns its own revisions:
//!
//! ```text
//! rev = "<n>-<first 32 hex chars of sha256(body)>"
//! ```
//!
//! where `n` counts writes of that document id.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryTarget;
pub use self::redis::RedisTarget;

use crate::change::{content_hash, Document};
use crate::error::BoxFuture;
use serde::{Deserialize, Serialize};

/// Result of writing one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub id: Option<String>,
    pub rev: Option<String>,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            rev: Some(rev.into()),
            error: None,
        }
    }

    pub fn failed(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            rev: None,
            error: Some(error.into()),
        }
    }

    /// A write counts only when both the id and the new revision came back.
    pub fn is_success(&self) -> bool {
        self.id.is_some() && self.rev.is_some() && self.error.is_none()
    }
}

/// What the replicator needs from a target.
pub trait TargetStore: Send + Sync + 'static {
    /// Establish the connection. Errors here are fatal to startup.
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Target database name, for status and logs.
    fn database_name(&self) -> &str;

    /// Write documents. Outcomes are returned in input order.
    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>>;
}

/// Compute the revision for the `generation`-th write of `body`.
pub fn revision(generation: u64, body: &[u8]) -> String {
    let hash = content_hash(body);
    format!("{}-{}", generation, &hash[..32])
}

/// Body bytes used for revision hashing.
pub(crate) fn body_bytes(doc: &Document) -> Vec<u8> {
    serde_json::to_vec(doc).unwrap_or_default()
}
