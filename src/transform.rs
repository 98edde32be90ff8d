// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transform stage.
//!
//! An optional pure mapping applied to every admitted document before it is
//! staged for writing. Unlike filter failures, a transform failure is fatal:
//! the routine encodes business rules and we refuse to replicate documents it
//! could not process. The error surfaces as [`ReplicationError::Transform`]
//! and stops the pipeline.

use crate::change::{document_id, Document};
use crate::error::{ReplicationError, Result, RoutineError};
use serde_json::Value;
use std::sync::Arc;

/// A document mapping routine.
pub trait DocumentTransform: Send + Sync + 'static {
    /// Routine name, reported in status.
    fn name(&self) -> &str;

    /// Human-readable definition, reported in status.
    fn definition(&self) -> Option<String> {
        None
    }

    /// Map one document.
    fn transform(&self, doc: Document) -> std::result::Result<Document, RoutineError>;
}

/// The transform stage. Identity when no routine is configured.
#[derive(Clone, Default)]
pub struct TransformStage {
    routine: Option<Arc<dyn DocumentTransform>>,
}

impl TransformStage {
    pub fn new(routine: Option<Arc<dyn DocumentTransform>>) -> Self {
        Self { routine }
    }

    /// Stage with no routine.
    pub fn identity() -> Self {
        Self { routine: None }
    }

    /// Apply the routine.
    pub fn apply(&self, doc: Document) -> Result<Document> {
        let Some(routine) = &self.routine else {
            return Ok(doc);
        };

        let doc_id = document_id(&doc).unwrap_or("<unknown>").to_string();
        routine
            .transform(doc)
            .map_err(|e| ReplicationError::Transform {
                routine: routine.name().to_string(),
                doc_id,
                message: e.to_string(),
            })
    }

    /// Configured routine name (None when unconfigured).
    pub fn name(&self) -> Option<&str> {
        self.routine.as_ref().map(|r| r.name())
    }

    /// Configured routine definition.
    pub fn definition(&self) -> Option<String> {
        self.routine.as_ref().and_then(|r| r.definition())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in transforms
// ═══════════════════════════════════════════════════════════════════════════════

/// Explicit identity routine. Reported in status, unlike an unconfigured stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl DocumentTransform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn definition(&self) -> Option<String> {
        Some("doc".to_string())
    }

    fn transform(&self, doc: Document) -> std::result::Result<Document, RoutineError> {
        Ok(doc)
    }
}

/// Removes the listed top-level fields.
#[derive(Debug, Clone)]
pub struct DropFields {
    fields: Vec<String>,
}

impl DropFields {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl DocumentTransform for DropFields {
    fn name(&self) -> &str {
        "drop-fields"
    }

    fn definition(&self) -> Option<String> {
        Some(format!("drop {}", self.fields.join(", ")))
    }

    fn transform(&self, mut doc: Document) -> std::result::Result<Document, RoutineError> {
        let Value::Object(map) = &mut doc else {
            return Err("document is not an object".into());
        };
        for field in &self.fields {
            map.remove(field);
        }
        Ok(doc)
    }
}

/// Wraps a closure as a named transform.
pub struct FnTransform<F> {
    name: String,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(Document) -> std::result::Result<Document, RoutineError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> DocumentTransform for FnTransform<F>
where
    F: Fn(Document) -> std::result::Result<Document, RoutineError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, doc: Document) -> std::result::Result<Document, RoutineError> {
        (self.f)(doc)
    }
}

/// Resolve a built-in transform by name.
///
/// `drop-fields:a,b` drops fields `a` and `b`.
pub fn builtin_transform(spec: &str) -> Result<Arc<dyn DocumentTransform>> {
    match spec.split_once(':') {
        None if spec == "identity" => Ok(Arc::new(Identity)),
        Some(("drop-fields", fields)) if !fields.is_empty() => {
            Ok(Arc::new(DropFields::new(fields.split(',').map(str::trim))))
        }
        _ => Err(ReplicationError::Config(format!(
            "Unknown transform routine '{}'",
            spec
        ))),
    }
}
