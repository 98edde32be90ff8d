// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idle flush timer with exponential backoff.
//!
//! Bounds the latency of a partially filled batch without waking a quiet
//! feed every `base` interval forever:
//!
//! ```text
//! fire, buffer empty and writer idle   → backoff = min(backoff + 1, max)
//!                                         next = base × 2^backoff
//! fire, otherwise                      → backoff = 0, next = base
//!                                         flush if the writer is idle
//! ```

use crate::config::{IdleFlushConfig, MAX_IDLE_BACKOFF};
use std::time::Duration;

/// What to do when the idle timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleDecision {
    /// Flush the staging buffer now.
    pub flush: bool,
    /// Delay until the next fire.
    pub next: Duration,
}

/// Idle flush timer state.
#[derive(Debug, Clone)]
pub struct IdleFlush {
    base: Duration,
    max_backoff: u32,
    backoff: u32,
}

impl IdleFlush {
    /// `max_backoff` is clamped to [`MAX_IDLE_BACKOFF`].
    pub fn new(base: Duration, max_backoff: u32) -> Self {
        Self {
            base,
            max_backoff: max_backoff.min(MAX_IDLE_BACKOFF),
            backoff: 0,
        }
    }

    pub fn from_config(config: &IdleFlushConfig) -> Self {
        Self::new(config.base_interval_duration(), config.max_backoff)
    }

    pub fn backoff(&self) -> u32 {
        self.backoff
    }

    /// Current interval: `base × 2^backoff`.
    pub fn interval(&self) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(self.backoff))
    }

    /// Apply one timer fire.
    pub fn on_fire(&mut self, buffer_empty: bool, writer_idle: bool) -> IdleDecision {
        if buffer_empty && writer_idle {
            self.backoff = (self.backoff + 1).min(self.max_backoff);
            return IdleDecision {
                flush: false,
                next: self.interval(),
            };
        }

        self.backoff = 0;
        IdleDecision {
            flush: !buffer_empty && writer_idle,
            next: self.base,
        }
    }
}
