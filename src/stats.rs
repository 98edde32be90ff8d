// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local replication statistics.
//!
//! Counters are atomics. Sequences and timestamps sit behind one
//! `tokio::sync::RwLock`. Only the batch writer and the feed controller
//! mutate them; everyone else reads a [`ReplicationStats`] snapshot.
//!
//! Stats are seeded from the stored checkpoint at startup and never
//! persisted directly.

use crate::checkpoint::Checkpoint;
use crate::sequence::Sequence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub copied: u64,
    pub failed: u64,
    pub filtered: u64,
    pub last_change_received_at: Option<DateTime<Utc>>,
    pub last_change_applied_at: Option<DateTime<Utc>>,
    /// Latest sequence seen on the feed.
    pub remote_seq: Option<Sequence>,
    /// Latest checkpointed sequence.
    pub last_applied_seq: Option<Sequence>,
}

#[derive(Debug, Default)]
struct Positions {
    last_change_received_at: Option<DateTime<Utc>>,
    last_change_applied_at: Option<DateTime<Utc>>,
    remote_seq: Option<Sequence>,
    last_applied_seq: Option<Sequence>,
}

#[derive(Debug, Default)]
struct Inner {
    copied: AtomicU64,
    failed: AtomicU64,
    filtered: AtomicU64,
    positions: RwLock<Positions>,
}

/// Shared handle to the statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Inner>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed positions from a stored checkpoint.
    pub async fn seed(&self, checkpoint: &Checkpoint) {
        let mut positions = self.inner.positions.write().await;
        positions.last_applied_seq = Some(checkpoint.last_seq.clone());
        positions.last_change_applied_at = Some(checkpoint.last_applied_at);
    }

    /// A change arrived from the feed.
    pub async fn record_received(&self, seq: &Sequence) {
        let mut positions = self.inner.positions.write().await;
        positions.last_change_received_at = Some(Utc::now());
        positions.remote_seq = Some(seq.clone());
    }

    pub fn record_filtered(&self) {
        self.inner.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_copied(&self, count: u64) {
        self.inner.copied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.inner.failed.fetch_add(count, Ordering::Relaxed);
    }

    /// A checkpoint was persisted. The applied sequence never moves back.
    pub async fn record_applied(&self, seq: &Sequence, at: DateTime<Utc>) {
        let mut positions = self.inner.positions.write().await;
        if positions.last_applied_seq.as_ref().map_or(true, |prev| seq > prev) {
            positions.last_applied_seq = Some(seq.clone());
        }
        positions.last_change_applied_at = Some(at);
    }

    pub fn copied(&self) -> u64 {
        self.inner.copied.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.inner.filtered.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> ReplicationStats {
        let positions = self.inner.positions.read().await;
        ReplicationStats {
            copied: self.copied(),
            failed: self.failed(),
            filtered: self.filtered(),
            last_change_received_at: positions.last_change_received_at,
            last_change_applied_at: positions.last_change_applied_at,
            remote_seq: positions.remote_seq.clone(),
            last_applied_seq: positions.last_applied_seq.clone(),
        }
    }
}
