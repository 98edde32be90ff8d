// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source change feeds.
//!
//! A [`SourceFeed`] delivers change notifications in sequence order, starting
//! after a given position. Delivery is at-least-once: a change may be seen
//! again after a restart, never skipped.
//!
//! ```text
//! SourceFeed::subscribe(since) ──► FeedSubscription
//!                                    ├── events: mpsc::Receiver<FeedEvent>
//!                                    └── control: FeedControl (pause/resume)
//! ```
//!
//! The transport owns reconnection. Disruptions surface as non-fatal
//! [`FeedEvent`]s; only [`FeedEvent::Stop`] (or a closed channel) ends the feed.
//!
//! # Implementations
//!
//! - [`MemorySource`]: in-process change log
//! - [`RedisSource`]: tails a Redis stream with `XREAD BLOCK`

pub mod memory;
pub mod redis;

pub use self::memory::MemorySource;
pub use self::redis::RedisSource;

use crate::change::ChangeNotification;
use crate::error::BoxFuture;
use crate::filter::FilterName;
use crate::sequence::Sequence;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Buffered events between a feed task and its consumer.
pub const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Subscription parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedOptions {
    /// Deliver changes strictly after this position.
    pub since: Sequence,
    /// Attach document bodies to notifications.
    pub include_docs: bool,
    /// Upstream filter evaluated by the source.
    pub filter: Option<FilterName>,
}

impl FeedOptions {
    pub fn since(since: Sequence) -> Self {
        Self {
            since,
            include_docs: true,
            filter: None,
        }
    }
}

/// One item of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A change notification.
    Change(ChangeNotification),
    /// The transport hit an error. It will retry on its own.
    Error(String),
    /// A read exceeded the request timeout.
    Timeout,
    /// The transport is about to retry after an error.
    Retry { attempt: usize, delay: Duration },
    /// No data for the inactivity window.
    Inactive,
    /// The feed ended.
    Stop,
}

impl FeedEvent {
    /// Short label for logs, metrics and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Change(_) => "change",
            FeedEvent::Error(_) => "error",
            FeedEvent::Timeout => "timeout",
            FeedEvent::Retry { .. } => "retry",
            FeedEvent::Inactive => "inactive",
            FeedEvent::Stop => "stop",
        }
    }
}

/// Pause/resume handle for a running subscription.
///
/// Level-triggered: pausing twice is the same as pausing once.
#[derive(Debug, Clone)]
pub struct FeedControl {
    paused: Arc<watch::Sender<bool>>,
}

impl FeedControl {
    /// Create a control handle and the receiver the feed task watches.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { paused: Arc::new(tx) }, rx)
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

/// Wait until the subscription is not paused.
///
/// Returns `false` when the control handle is gone.
pub(crate) async fn wait_until_resumed(paused: &mut watch::Receiver<bool>) -> bool {
    paused.wait_for(|p| !*p).await.is_ok()
}

/// A live subscription. Dropping it stops the feed task.
pub struct FeedSubscription {
    pub events: mpsc::Receiver<FeedEvent>,
    pub control: FeedControl,
    task: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<FeedEvent>, control: FeedControl, task: Option<JoinHandle<()>>) -> Self {
        Self { events, control, task }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// What the replicator needs from a source.
pub trait SourceFeed: Send + Sync + 'static {
    /// Establish the connection. Errors here are fatal to startup.
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Source database name, for status and logs.
    fn database_name(&self) -> &str;

    /// Look up a named upstream filter. `None` when it does not exist.
    fn resolve_filter(&self, name: &FilterName) -> BoxFuture<'_, Option<String>>;

    /// Start delivering changes after `options.since`.
    fn subscribe(&self, options: FeedOptions) -> BoxFuture<'_, FeedSubscription>;
}
