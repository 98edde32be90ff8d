// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process target store with fault injection.
//!
//! Records every bulk write call so tests can check batch composition and
//! ordering. Faults:
//!
//! - `fail_ids`: those documents fail individually
//! - `fail_calls(n)`: the next `n` calls fail as a whole
//! - `hold_writes(true)`: calls block until released

use super::{body_bytes, revision, TargetStore, WriteOutcome};
use crate::change::{document_id, Document};
use crate::error::{BoxFuture, ReplicationError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Default)]
struct State {
    docs: HashMap<String, (u64, String, Document)>,
    calls: Vec<Vec<Document>>,
    fail_ids: HashSet<String>,
}

/// In-memory target.
#[derive(Clone)]
pub struct MemoryTarget {
    database: String,
    state: Arc<Mutex<State>>,
    failing_calls: Arc<AtomicUsize>,
    hold: Arc<watch::Sender<bool>>,
}

impl MemoryTarget {
    pub fn new(database: impl Into<String>) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            database: database.into(),
            state: Arc::new(Mutex::new(State::default())),
            failing_calls: Arc::new(AtomicUsize::new(0)),
            hold: Arc::new(hold),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make writes of these document ids fail individually.
    pub fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().fail_ids.extend(ids.into_iter().map(Into::into));
    }

    /// Make the next `count` bulk write calls fail as a whole.
    pub fn fail_calls(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Block bulk writes until called again with `false`.
    pub fn hold_writes(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    /// Stored document and revision.
    pub fn get(&self, id: &str) -> Option<(String, Document)> {
        self.state().docs.get(id).map(|(_, rev, doc)| (rev.clone(), doc.clone()))
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.state().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents of every bulk write call, in call order (failed calls included).
    pub fn calls(&self) -> Vec<Vec<Document>> {
        self.state().calls.clone()
    }

    /// Document ids of every call, in call order.
    pub fn call_ids(&self) -> Vec<Vec<String>> {
        self.calls()
            .iter()
            .map(|call| {
                call.iter()
                    .map(|doc| document_id(doc).unwrap_or_default().to_string())
                    .collect()
            })
            .collect()
    }

    fn write_one(state: &mut State, doc: Document) -> WriteOutcome {
        let Some(id) = document_id(&doc).map(str::to_string) else {
            return WriteOutcome::failed(None, "document has no string _id");
        };
        if state.fail_ids.contains(&id) {
            return WriteOutcome::failed(Some(id), "forbidden");
        }

        let generation = state.docs.get(&id).map(|(n, _, _)| n + 1).unwrap_or(1);
        let rev = revision(generation, &body_bytes(&doc));
        state.docs.insert(id.clone(), (generation, rev.clone(), doc));
        WriteOutcome::ok(id, rev)
    }
}

impl TargetStore for MemoryTarget {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn bulk_write(&self, docs: Vec<Document>) -> BoxFuture<'_, Vec<WriteOutcome>> {
        Box::pin(async move {
            let mut held = self.hold.subscribe();
            let _ = held.wait_for(|h| !*h).await;

            let mut state = self.state();
            state.calls.push(docs.clone());

            if self
                .failing_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ReplicationError::target(&self.database, "connection reset"));
            }

            Ok(docs
                .into_iter()
                .map(|doc| Self::write_one(&mut state, doc))
                .collect())
        })
    }
}
