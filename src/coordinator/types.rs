//! Replicator and feed state types.
//!
//! # Replicator lifecycle
//!
//! ```text
//!            start()
//! Created ──────────▶ ConnectingSource ──▶ ConnectingTarget ──▶ LoadingFilters
//!                            │                    │                   │
//!                            ▼                    ▼                   ▼
//!                          Failed ◀────────── (any step fails) ◀──────┤
//!                            ▲                                        │
//!                            │                                        ▼
//!                            │         Subscribing ◀──────── LoadingTransform
//!                            │              │
//!                            │              ▼
//!                  (transform error)     Active ──── (stop) ───▶ Stopped
//! ```
//!
//! # Feed
//!
//! ```text
//! Starting ──▶ Active ⇄ Paused
//!                 │
//!                 ▼
//!              Stopped
//! ```

use std::fmt;

/// State of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Constructed, `start()` not called yet.
    Created,
    ConnectingSource,
    ConnectingTarget,
    /// Resolving the upstream filter and loading the local predicate.
    LoadingFilters,
    LoadingTransform,
    /// Loading the checkpoint and opening the change feed.
    Subscribing,
    /// Feed controller running.
    Active,
    /// Stopped cleanly (source stop, channel closed or shutdown).
    Stopped,
    /// Startup step failed, or a transform error halted the pipeline.
    Failed,
}

impl ReplicatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatorState::Created => "Created",
            ReplicatorState::ConnectingSource => "ConnectingSource",
            ReplicatorState::ConnectingTarget => "ConnectingTarget",
            ReplicatorState::LoadingFilters => "LoadingFilters",
            ReplicatorState::LoadingTransform => "LoadingTransform",
            ReplicatorState::Subscribing => "Subscribing",
            ReplicatorState::Active => "Active",
            ReplicatorState::Stopped => "Stopped",
            ReplicatorState::Failed => "Failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicatorState::Stopped | ReplicatorState::Failed)
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Starting,
    Active,
    /// Paused by backpressure.
    Paused,
    Stopped,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Starting => "Starting",
            FeedState::Active => "Active",
            FeedState::Paused => "Paused",
            FeedState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
