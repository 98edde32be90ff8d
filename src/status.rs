// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Status snapshot for the external status console.

use crate::filter::FilterStage;
use crate::sequence::Sequence;
use crate::stats::ReplicationStats;
use crate::transform::TransformStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub database: String,
    pub last_change_received_at: Option<DateTime<Utc>>,
    pub remote_seq: Option<Sequence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub database: String,
    pub copied: u64,
    pub failed: u64,
    pub last_applied_seq: Option<Sequence>,
    pub last_change_applied_at: Option<DateTime<Utc>>,
}

/// Name and definition of a routine. Both null when unconfigured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutineStatus {
    pub name: Option<String>,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFilterStatus {
    pub name: Option<String>,
    pub definition: Option<String>,
    pub filtered: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStatus {
    pub server: RoutineStatus,
    pub client: ClientFilterStatus,
}

/// Everything the status console shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub task_id: String,
    /// Replicator lifecycle state.
    pub state: String,
    /// Subscription state (Starting, Active, Paused, Stopped).
    pub feed: String,
    pub source: SourceStatus,
    pub target: TargetStatus,
    pub filter: FilterStatus,
    pub transformer: RoutineStatus,
}

/// Inputs for [`StatusSnapshot::build`].
pub struct StatusParts<'a> {
    pub task_id: &'a str,
    pub state: String,
    pub feed: String,
    pub source_database: &'a str,
    pub target_database: &'a str,
    pub stats: ReplicationStats,
    pub filter: &'a FilterStage,
    pub transform: &'a TransformStage,
}

impl StatusSnapshot {
    pub fn build(parts: StatusParts<'_>) -> Self {
        let StatusParts {
            task_id,
            state,
            feed,
            source_database,
            target_database,
            stats,
            filter,
            transform,
        } = parts;

        let server = filter
            .upstream()
            .map(|f| RoutineStatus {
                name: Some(f.name.to_string()),
                definition: Some(f.definition.clone()),
            })
            .unwrap_or_default();

        let client = ClientFilterStatus {
            name: filter.local().map(|p| p.name().to_string()),
            definition: filter.local().and_then(|p| p.definition()),
            filtered: stats.filtered,
        };

        Self {
            task_id: task_id.to_string(),
            state,
            feed,
            source: SourceStatus {
                database: source_database.to_string(),
                last_change_received_at: stats.last_change_received_at,
                remote_seq: stats.remote_seq.clone(),
            },
            target: TargetStatus {
                database: target_database.to_string(),
                copied: stats.copied,
                failed: stats.failed,
                last_applied_seq: stats.last_applied_seq.clone(),
                last_change_applied_at: stats.last_change_applied_at,
            },
            filter: FilterStatus { server, client },
            transformer: RoutineStatus {
                name: transform.name().map(str::to_string),
                definition: transform.definition(),
            },
        }
    }
}
