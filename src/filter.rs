// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filter stage: two-phase admission control.
//!
//! ```text
//!            source                     │              replicator
//!  ┌──────────────────────────┐         │   ┌──────────────────────────────┐
//!  │ upstream (server) filter │──feed──►│──►│ body check + local predicate │──► admitted
//!  │  named "group/name"      │         │   │  (ChangePredicate)           │
//!  └──────────────────────────┘         │   └──────────────────────────────┘
//! ```
//!
//! The upstream filter is registered in the source and runs before a change
//! is ever delivered. We only resolve it by name at startup; a missing name
//! is a configuration error.
//!
//! The local predicate is injected. A predicate error rejects the change and
//! is logged. It is never retried and never counts as a write failure.

use crate::change::{ChangeNotification, Document};
use crate::error::{ReplicationError, Result, RoutineError};
use crate::metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{trace, warn};

/// A predicate over change notifications.
pub trait ChangePredicate: Send + Sync + 'static {
    /// Routine name, reported in status.
    fn name(&self) -> &str;

    /// Human-readable definition, reported in status.
    fn definition(&self) -> Option<String> {
        None
    }

    /// Decide whether the change should be replicated.
    fn admit(&self, change: &ChangeNotification) -> std::result::Result<bool, RoutineError>;
}

/// Qualified name of an upstream filter: `group/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterName {
    pub group: String,
    pub name: String,
}

impl FilterName {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FilterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

impl FromStr for FilterName {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((group, name)) if !group.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(group, name))
            }
            _ => Err(ReplicationError::Config(format!(
                "Invalid filter name '{}', expected 'group/name'",
                s
            ))),
        }
    }
}

/// A resolved upstream filter, kept for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFilter {
    pub name: FilterName,
    pub definition: String,
}

/// Field-equality selector.
///
/// Matches a document when every top-level field of the selector is present
/// in the document with an equal value. An empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector(Map<String, Value>);

impl Selector {
    /// Parse a selector from its JSON definition.
    pub fn parse(definition: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(definition) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(ReplicationError::Config(format!(
                "Selector must be a JSON object, got {}",
                other
            ))),
            Err(e) => Err(ReplicationError::Config(format!("Invalid selector JSON: {}", e))),
        }
    }

    /// Check a document against the selector.
    pub fn matches(&self, doc: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }

    /// Check a change. A change without a body only matches an empty selector.
    pub fn matches_change(&self, change: &ChangeNotification) -> bool {
        match &change.doc {
            Some(doc) => self.matches(doc),
            None => self.0.is_empty(),
        }
    }
}

/// The filter stage.
pub struct FilterStage {
    upstream: Option<UpstreamFilter>,
    local: Option<Arc<dyn ChangePredicate>>,
}

impl FilterStage {
    /// Create a filter stage.
    pub fn new(upstream: Option<UpstreamFilter>, local: Option<Arc<dyn ChangePredicate>>) -> Self {
        Self { upstream, local }
    }

    /// A stage that admits every change with a valid body.
    pub fn pass_through() -> Self {
        Self::new(None, None)
    }

    /// Decide whether a delivered change is admitted.
    ///
    /// Changes without a JSON object body are always rejected.
    pub fn admit(&self, change: &ChangeNotification) -> bool {
        let admitted = if !change.has_valid_body() {
            trace!(seq = %change.seq, id = %change.id, "Rejected change without a valid body");
            false
        } else {
            match &self.local {
                None => true,
                Some(predicate) => match predicate.admit(change) {
                    Ok(admit) => admit,
                    Err(e) => {
                        warn!(
                            filter = predicate.name(),
                            seq = %change.seq,
                            id = %change.id,
                            error = %e,
                            "Local filter failed, rejecting change"
                        );
                        false
                    }
                },
            }
        };

        if !admitted {
            metrics::record_notifications_filtered(1);
        }
        admitted
    }

    /// The resolved upstream filter, if configured.
    pub fn upstream(&self) -> Option<&UpstreamFilter> {
        self.upstream.as_ref()
    }

    /// The local predicate, if configured.
    pub fn local(&self) -> Option<&Arc<dyn ChangePredicate>> {
        self.local.as_ref()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in predicates
// ═══════════════════════════════════════════════════════════════════════════════

/// Rejects deletions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDeleted;

impl ChangePredicate for SkipDeleted {
    fn name(&self) -> &str {
        "skip-deleted"
    }

    fn definition(&self) -> Option<String> {
        Some("!change.deleted".to_string())
    }

    fn admit(&self, change: &ChangeNotification) -> std::result::Result<bool, RoutineError> {
        Ok(!change.deleted)
    }
}

/// Rejects design documents (`_design/...`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDesignDocuments;

impl ChangePredicate for SkipDesignDocuments {
    fn name(&self) -> &str {
        "skip-design-docs"
    }

    fn definition(&self) -> Option<String> {
        Some("!change.id.starts_with(\"_design/\")".to_string())
    }

    fn admit(&self, change: &ChangeNotification) -> std::result::Result<bool, RoutineError> {
        Ok(!change.id.starts_with("_design/"))
    }
}

/// Wraps a closure as a named predicate.
pub struct FnPredicate<F> {
    name: String,
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&ChangeNotification) -> std::result::Result<bool, RoutineError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> ChangePredicate for FnPredicate<F>
where
    F: Fn(&ChangeNotification) -> std::result::Result<bool, RoutineError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn admit(&self, change: &ChangeNotification) -> std::result::Result<bool, RoutineError> {
        (self.f)(change)
    }
}

/// Resolve a built-in local predicate by name.
pub fn builtin_predicate(name: &str) -> Result<Arc<dyn ChangePredicate>> {
    match name {
        "skip-deleted" => Ok(Arc::new(SkipDeleted)),
        "skip-design-docs" => Ok(Arc::new(SkipDesignDocuments)),
        other => Err(ReplicationError::Config(format!("Unknown filter routine '{}'", other))),
    }
}
