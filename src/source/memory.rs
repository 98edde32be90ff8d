// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process change feed.
//!
//! An append-only log of changes with registered upstream filters. Used for
//! embedding and as the source in pipeline tests: it records every
//! subscription so callers can check where a feed started.

use super::{wait_until_resumed, FeedControl, FeedEvent, FeedOptions, FeedSubscription, SourceFeed, FEED_CHANNEL_CAPACITY};
use crate::change::{ChangeNotification, Document};
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::filter::{ChangePredicate, FilterName};
use crate::sequence::Sequence;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum LogEntry {
    Change(ChangeNotification),
    /// Transport event injected by tests, delivered to subscriptions opened before it.
    Event(FeedEvent),
}

struct Inner {
    log: Mutex<Vec<LogEntry>>,
    filters: Mutex<HashMap<FilterName, Arc<dyn ChangePredicate>>>,
    subscriptions: Mutex<Vec<FeedOptions>>,
    notify: Notify,
    closed: AtomicBool,
    next_seq: AtomicU64,
    failing_connects: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn entry_at(&self, index: usize) -> Option<LogEntry> {
        lock(&self.log).get(index).cloned()
    }

    fn push(&self, entry: LogEntry) {
        lock(&self.log).push(entry);
        self.notify.notify_waiters();
    }
}

/// In-memory change feed.
#[derive(Clone)]
pub struct MemorySource {
    database: String,
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            inner: Arc::new(Inner {
                log: Mutex::new(Vec::new()),
                filters: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                next_seq: AtomicU64::new(1),
                failing_connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Append a document write at the next numeric sequence.
    pub fn append(&self, id: &str, doc: Document) -> Sequence {
        let seq = Sequence::from(self.inner.next_seq.fetch_add(1, Ordering::SeqCst));
        self.push(ChangeNotification::new(seq.clone(), id, doc));
        seq
    }

    /// Append a deletion at the next numeric sequence.
    pub fn append_deletion(&self, id: &str, tombstone: Option<Document>) -> Sequence {
        let seq = Sequence::from(self.inner.next_seq.fetch_add(1, Ordering::SeqCst));
        self.push(ChangeNotification::deletion(seq.clone(), id, tombstone));
        seq
    }

    /// Append a change with an explicit sequence.
    pub fn push(&self, change: ChangeNotification) {
        self.inner.push(LogEntry::Change(change));
    }

    /// Inject a transport event into live subscriptions.
    pub fn emit(&self, event: FeedEvent) {
        self.inner.push(LogEntry::Event(event));
    }

    /// Register a named upstream filter.
    pub fn register_filter(&self, name: FilterName, predicate: Arc<dyn ChangePredicate>) {
        lock(&self.inner.filters).insert(name, predicate);
    }

    /// End all subscriptions with [`FeedEvent::Stop`] once they have caught up.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Options of every subscription opened so far.
    pub fn subscriptions(&self) -> Vec<FeedOptions> {
        lock(&self.inner.subscriptions).clone()
    }

    /// Number of changes in the log.
    pub fn len(&self) -> usize {
        lock(&self.inner.log)
            .iter()
            .filter(|e| matches!(e, LogEntry::Change(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SourceFeed for MemorySource {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let failing = &self.inner.failing_connects;
            if failing
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ReplicationError::source(&self.database, "connection refused"));
            }
            debug!(database = %self.database, "Memory source connected");
            Ok(())
        })
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn resolve_filter(&self, name: &FilterName) -> BoxFuture<'_, Option<String>> {
        let found = lock(&self.inner.filters)
            .get(name)
            .map(|p| p.definition().unwrap_or_else(|| p.name().to_string()));
        Box::pin(async move { Ok(found) })
    }

    fn subscribe(&self, options: FeedOptions) -> BoxFuture<'_, FeedSubscription> {
        Box::pin(async move {
            let predicate = match &options.filter {
                None => None,
                Some(name) => Some(lock(&self.inner.filters).get(name).cloned().ok_or_else(|| {
                    ReplicationError::Config(format!("Upstream filter '{}' not found", name))
                })?),
            };

            let first_live_index = lock(&self.inner.log).len();
            lock(&self.inner.subscriptions).push(options.clone());

            let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
            let (control, paused) = FeedControl::new();
            let inner = Arc::clone(&self.inner);
            let task = tokio::spawn(run_feed(inner, options, first_live_index, predicate, tx, paused));

            Ok(FeedSubscription::new(rx, control, Some(task)))
        })
    }
}

async fn run_feed(
    inner: Arc<Inner>,
    options: FeedOptions,
    first_live_index: usize,
    predicate: Option<Arc<dyn ChangePredicate>>,
    tx: mpsc::Sender<FeedEvent>,
    mut paused: watch::Receiver<bool>,
) {
    let mut cursor = 0usize;

    loop {
        if !wait_until_resumed(&mut paused).await {
            return;
        }

        // Register interest before looking, so an append in between is not missed
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match inner.entry_at(cursor) {
            Some(entry) => {
                let index = cursor;
                cursor += 1;
                let event = match entry {
                    LogEntry::Change(change) => {
                        if change.seq <= options.since {
                            continue;
                        }
                        if let Some(predicate) = &predicate {
                            match predicate.admit(&change) {
                                Ok(true) => {}
                                Ok(false) => continue,
                                Err(e) => {
                                    warn!(filter = predicate.name(), id = %change.id, error = %e, "Upstream filter failed");
                                    continue;
                                }
                            }
                        }
                        let mut change = change;
                        if !options.include_docs {
                            change.doc = None;
                        }
                        FeedEvent::Change(change)
                    }
                    LogEntry::Event(_) if index < first_live_index => continue,
                    LogEntry::Event(event) => event,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            None if inner.closed.load(Ordering::SeqCst) => {
                let _ = tx.send(FeedEvent::Stop).await;
                return;
            }
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tx.closed() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FnPredicate;
    use serde_json::json;
    use std::time::Duration;

    async fn next_change(sub: &mut FeedSubscription) -> ChangeNotification {
        match tokio::time::timeout(Duration::from_secs(5), sub.events.recv()).await {
            Ok(Some(FeedEvent::Change(c))) => c,
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivers_after_since() {
        let source = MemorySource::new("orders");
        source.append("a", json!({"_id": "a"}));
        source.append("b", json!({"_id": "b"}));
        source.append("c", json!({"_id": "c"}));

        let mut sub = source.subscribe(FeedOptions::since(Sequence::from(1))).await.unwrap();
        assert_eq!(next_change(&mut sub).await.id, "b");
        assert_eq!(next_change(&mut sub).await.id, "c");
    }

    #[tokio::test]
    async fn test_live_tailing() {
        let source = MemorySource::new("orders");
        let mut sub = source.subscribe(FeedOptions::since(Sequence::zero())).await.unwrap();

        let writer = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("late", json!({"_id": "late"}));
        });

        let change = next_change(&mut sub).await;
        assert_eq!(change.id, "late");
        assert_eq!(change.seq, Sequence::from(1));
    }

    #[tokio::test]
    async fn test_close_sends_stop() {
        let source = MemorySource::new("orders");
        source.append("a", json!({"_id": "a"}));
        source.close();

        let mut sub = source.subscribe(FeedOptions::since(Sequence::zero())).await.unwrap();
        assert_eq!(next_change(&mut sub).await.id, "a");
        assert_eq!(sub.events.recv().await, Some(FeedEvent::Stop));
    }

    #[tokio::test]
    async fn test_upstream_filter_applied_before_delivery() {
        let source = MemorySource::new("orders");
        let name = FilterName::new("app", "eu_only");
        source.register_filter(
            name.clone(),
            Arc::new(FnPredicate::new("eu_only", |c: &ChangeNotification| {
                Ok(c.doc.as_ref().and_then(|d| d.get("region")) == Some(&json!("eu")))
            })),
        );
        source.append("us-1", json!({"region": "us"}));
        source.append("eu-1", json!({"region": "eu"}));
        source.close();

        let options = FeedOptions {
            filter: Some(name),
            ..FeedOptions::since(Sequence::zero())
        };
        let mut sub = source.subscribe(options).await.unwrap();
        assert_eq!(next_change(&mut sub).await.id, "eu-1");
        assert_eq!(sub.events.recv().await, Some(FeedEvent::Stop));
    }

    #[tokio::test]
    async fn test_unknown_filter_is_config_error() {
        let source = MemorySource::new("orders");
        let name = FilterName::new("app", "missing");
        assert_eq!(source.resolve_filter(&name).await.unwrap(), None);

        let options = FeedOptions {
            filter: Some(name),
            ..FeedOptions::since(Sequence::zero())
        };
        let err = source.subscribe(options).await.err().unwrap();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[tokio::test]
    async fn test_without_docs() {
        let source = MemorySource::new("orders");
        source.append("a", json!({"_id": "a"}));
        let options = FeedOptions {
            include_docs: false,
            ..FeedOptions::since(Sequence::zero())
        };
        let mut sub = source.subscribe(options).await.unwrap();
        assert!(next_change(&mut sub).await.doc.is_none());
    }

    #[tokio::test]
    async fn test_pause_holds_delivery() {
        let source = MemorySource::new("orders");
        let mut sub = source.subscribe(FeedOptions::since(Sequence::zero())).await.unwrap();
        sub.control.pause();
        tokio::task::yield_now().await;

        source.append("a", json!({"_id": "a"}));
        let held = tokio::time::timeout(Duration::from_millis(50), sub.events.recv()).await;
        assert!(held.is_err(), "paused feed delivered a change");

        sub.control.resume();
        assert_eq!(next_change(&mut sub).await.id, "a");
    }

    #[tokio::test]
    async fn test_emitted_events_reach_live_subscriptions() {
        let source = MemorySource::new("orders");
        source.emit(FeedEvent::Timeout);
        let mut sub = source.subscribe(FeedOptions::since(Sequence::zero())).await.unwrap();
        source.emit(FeedEvent::Inactive);
        source.close();
        assert_eq!(sub.events.recv().await, Some(FeedEvent::Inactive));
        assert_eq!(sub.events.recv().await, Some(FeedEvent::Stop));
    }

    #[tokio::test]
    async fn test_records_subscriptions_and_connect_failures() {
        let source = MemorySource::new("orders");
        source.fail_connects(1);
        assert!(source.connect().await.is_err());
        assert!(source.connect().await.is_ok());

        let _sub = source.subscribe(FeedOptions::since(Sequence::from(100))).await.unwrap();
        assert_eq!(source.subscriptions()[0].since, Sequence::from(100));
    }
}
