// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end pipeline tests: memory source → replicator → memory target,
//! with a file-backed SQLite checkpoint store.
//!
//! Run with: cargo test --test pipeline

mod common;

use chrono::Utc;
use common::*;
use feed_replicator::checkpoint::{CheckpointRepository, EventType};
use feed_replicator::config::CheckpointPolicy;
use feed_replicator::error::RoutineError;
use feed_replicator::filter::{FilterName, FnPredicate, SkipDeleted};
use feed_replicator::transform::{DropFields, Identity};
use feed_replicator::{ChangeNotification, FeedState, ReplicatorState, Sequence};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Core scenarios
// =============================================================================

#[tokio::test]
async fn test_clean_run_skips_deleted() {
    let p = Pipeline::new().await;
    p.source.append("A", json!({"_id": "A", "n": 1}));
    p.source.append_deletion("B", Some(json!({"_id": "B", "_deleted": true})));
    p.source.append("C", json!({"_id": "C", "n": 3}));
    p.source.close();

    let mut r = p
        .replicator()
        .with_predicate(Arc::new(SkipDeleted))
        .with_transform(Arc::new(Identity));
    run_to_completion(&mut r).await.unwrap();

    assert_eq!(p.target.call_ids(), vec![vec!["A".to_string(), "C".to_string()]]);
    assert_eq!(p.checkpoint().await, Some(Sequence::from(3)));

    let status = r.status().await;
    assert_eq!(status.target.copied, 2);
    assert_eq!(status.target.failed, 0);
    assert_eq!(status.filter.client.filtered, 1);
    assert_eq!(status.filter.client.name.as_deref(), Some("skip-deleted"));
    assert_eq!(status.transformer.name.as_deref(), Some("identity"));
    assert_eq!(status.source.remote_seq, Some(Sequence::from(3)));
    assert_eq!(status.target.last_applied_seq, Some(Sequence::from(3)));
}

#[tokio::test]
async fn test_partial_failure_checkpoints_confirmed_documents() {
    let p = Pipeline::new().await;
    p.target.fail_ids(["B"]);
    p.source.append("A", json!({"_id": "A"}));
    p.source.append("B", json!({"_id": "B"}));
    p.source.close();

    let mut r = p.replicator();
    // The batch error is reported per batch, not by run()
    run_to_completion(&mut r).await.unwrap();

    let stats = r.stats().snapshot().await;
    assert_eq!(stats.copied, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(p.checkpoint().await, Some(Sequence::from(1)));

    let events = p.events().await;
    let failure = events
        .iter()
        .find(|e| e.event_type == EventType::Error && e.payload["stage"] == "document_write")
        .expect("document failure event");
    assert_eq!(failure.payload["id"], "B");
    assert_eq!(failure.payload["seq"], "2");
}

#[tokio::test]
async fn test_restart_flag_ignores_checkpoint() {
    let mut p = Pipeline::new().await;
    p.store
        .save(&p.task_id(), &Sequence::from(100), Utc::now())
        .await
        .unwrap();
    p.config.restart = true;
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    let subs = p.source.subscriptions();
    assert_eq!(subs.len(), 1);
    assert!(subs[0].since.is_zero());
}

#[tokio::test]
async fn test_resume_from_checkpoint() {
    let p = Pipeline::new().await;
    p.store
        .save(&p.task_id(), &Sequence::from(100), Utc::now())
        .await
        .unwrap();
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    let subs = p.source.subscriptions();
    assert_eq!(subs[0].since, Sequence::from(100));
    assert!(subs[0].include_docs);

    let status = r.status().await;
    assert_eq!(status.target.last_applied_seq, Some(Sequence::from(100)));
}

#[tokio::test]
async fn test_second_run_resumes_after_first() {
    let mut p = Pipeline::new().await;
    p.config.settings.batch.batch_size = 3;
    for id in ["a", "b", "c"] {
        p.source.append(id, json!({"_id": id}));
    }

    let mut first = p.replicator();
    first.start().await.unwrap();
    assert!(wait_until(|| p.target.len() == 3).await);
    first.shutdown();
    tokio::time::timeout(STEP_TIMEOUT, first.run()).await.unwrap().unwrap();
    assert_eq!(p.checkpoint().await, Some(Sequence::from(3)));

    p.source.append("d", json!({"_id": "d"}));
    p.source.close();

    let mut second = p.replicator();
    run_to_completion(&mut second).await.unwrap();

    assert_eq!(p.source.subscriptions()[1].since, Sequence::from(3));
    assert_eq!(p.target.call_ids().last().unwrap(), &vec!["d".to_string()]);
    assert_eq!(p.checkpoint().await, Some(Sequence::from(4)));
}

// =============================================================================
// Batching and flushing
// =============================================================================

#[tokio::test]
async fn test_batches_never_exceed_batch_size() {
    let mut p = Pipeline::new().await;
    p.config.settings.batch.batch_size = 3;
    for i in 0..10 {
        let id = format!("doc-{}", i);
        p.source.append(&id, json!({"_id": id}));
    }
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    let calls = p.target.call_ids();
    assert!(calls.iter().all(|c| c.len() <= 3));
    assert_eq!(calls.iter().map(Vec::len).sum::<usize>(), 10);

    // Receipt order is preserved across batches
    let flat: Vec<String> = calls.into_iter().flatten().collect();
    let expected: Vec<String> = (0..10).map(|i| format!("doc-{}", i)).collect();
    assert_eq!(flat, expected);
    assert_eq!(p.checkpoint().await, Some(Sequence::from(10)));
}

#[tokio::test]
async fn test_idle_flush_writes_partial_batch() {
    let mut p = Pipeline::new().await;
    p.config.settings.idle_flush.base_interval = "50ms".into();
    p.source.append("a", json!({"_id": "a"}));

    let mut r = p.replicator();
    r.start().await.unwrap();

    assert!(wait_until(|| p.target.len() == 1).await, "idle flush never wrote");
    assert_eq!(r.state(), ReplicatorState::Active);

    r.shutdown();
    tokio::time::timeout(STEP_TIMEOUT, r.run()).await.unwrap().unwrap();
    assert_eq!(p.checkpoint().await, Some(Sequence::from(1)));
}

#[tokio::test]
async fn test_shutdown_flushes_staged_documents() {
    let p = Pipeline::new().await;
    p.source.append("a", json!({"_id": "a"}));
    p.source.append("b", json!({"_id": "b"}));

    let mut r = p.replicator();
    r.start().await.unwrap();
    assert!(wait_until(|| r.feed_state() == FeedState::Active).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    r.shutdown();
    tokio::time::timeout(STEP_TIMEOUT, r.run()).await.unwrap().unwrap();

    assert_eq!(p.target.len(), 2);
    assert_eq!(r.state(), ReplicatorState::Stopped);

    let events = p.events().await;
    assert_eq!(events.first().map(|e| e.event_type), Some(EventType::Start));
    let stop = events.last().unwrap();
    assert_eq!(stop.event_type, EventType::Stop);
    assert_eq!(stop.payload["reason"], "shutdown");
}

// =============================================================================
// Filters and transforms
// =============================================================================

fn eu_only(change: &ChangeNotification) -> Result<bool, RoutineError> {
    Ok(change.doc.as_ref().map_or(false, |d| d["region"] == "eu"))
}

fn refuse_bad(change: &ChangeNotification) -> Result<bool, RoutineError> {
    if change.id == "bad" {
        return Err("cannot evaluate".into());
    }
    Ok(true)
}

#[tokio::test]
async fn test_upstream_filter_applied_by_source() {
    let mut p = Pipeline::new().await;
    p.config.filter.server = Some("app/eu".into());
    p.source.register_filter(
        FilterName::new("app", "eu"),
        Arc::new(FnPredicate::new("eu", eu_only)),
    );
    p.source.append("a", json!({"_id": "a", "region": "eu"}));
    p.source.append("b", json!({"_id": "b", "region": "us"}));
    p.source.append("c", json!({"_id": "c", "region": "eu"}));
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    assert_eq!(p.target.call_ids(), vec![vec!["a".to_string(), "c".to_string()]]);
    let subs = p.source.subscriptions();
    assert_eq!(subs[0].filter, Some(FilterName::new("app", "eu")));

    let status = r.status().await;
    assert_eq!(status.filter.server.name.as_deref(), Some("app/eu"));
    // Upstream rejections never reach the local stage
    assert_eq!(status.filter.client.filtered, 0);
}

#[tokio::test]
async fn test_local_filter_error_rejects_change() {
    let p = Pipeline::new().await;
    p.source.append("a", json!({"_id": "a"}));
    p.source.append("bad", json!({"_id": "bad"}));
    p.source.close();

    let mut r = p
        .replicator()
        .with_predicate(Arc::new(FnPredicate::new("picky", refuse_bad)));
    run_to_completion(&mut r).await.unwrap();

    assert_eq!(p.target.call_ids(), vec![vec!["a".to_string()]]);
    assert_eq!(r.status().await.filter.client.filtered, 1);
}

#[tokio::test]
async fn test_revision_stripped_and_transform_applied() {
    let mut p = Pipeline::new().await;
    p.config.transform = Some("drop-fields:secret".into());
    p.source.append("a", json!({"_id": "a", "_rev": "7-abc", "secret": "x", "keep": 1}));
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    let (rev, doc) = p.target.get("a").unwrap();
    assert!(rev.starts_with("1-"));
    assert_eq!(doc, json!({"_id": "a", "keep": 1}));
}

#[tokio::test]
async fn test_configured_transform_overridden_by_injected() {
    let mut p = Pipeline::new().await;
    p.config.transform = Some("drop-fields:keep".into());
    p.source.append("a", json!({"_id": "a", "keep": 1}));
    p.source.close();

    let mut r = p
        .replicator()
        .with_transform(Arc::new(DropFields::new(["other"])));
    run_to_completion(&mut r).await.unwrap();

    assert_eq!(p.target.get("a").unwrap().1["keep"], 1);
}

#[tokio::test]
async fn test_changes_without_body_are_filtered() {
    let p = Pipeline::new().await;
    p.source.push(ChangeNotification::bare(1u64, "no-body"));
    p.source.push(ChangeNotification::new(2u64, "scalar", json!(42)));
    p.source.push(ChangeNotification::new(3u64, "ok", json!({"n": 1})));
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();

    assert_eq!(p.target.call_ids(), vec![vec!["ok".to_string()]]);
    // _id filled from the notification
    assert_eq!(p.target.get("ok").unwrap().1["_id"], "ok");
    assert_eq!(r.status().await.filter.client.filtered, 2);
}

// =============================================================================
// Checkpoint policy
// =============================================================================

#[tokio::test]
async fn test_highest_success_policy_skips_past_failure() {
    let mut p = Pipeline::new().await;
    p.config.settings.batch.checkpoint_policy = CheckpointPolicy::HighestSuccess;
    p.target.fail_ids(["b"]);
    for id in ["a", "b", "c"] {
        p.source.append(id, json!({"_id": id}));
    }
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();
    assert_eq!(p.checkpoint().await, Some(Sequence::from(3)));
}

#[tokio::test]
async fn test_contiguous_policy_stops_at_failure() {
    let p = Pipeline::new().await;
    p.target.fail_ids(["b"]);
    for id in ["a", "b", "c"] {
        p.source.append(id, json!({"_id": id}));
    }
    p.source.close();

    let mut r = p.replicator();
    run_to_completion(&mut r).await.unwrap();
    assert_eq!(p.checkpoint().await, Some(Sequence::from(1)));
    assert_eq!(r.stats().copied(), 2);
    assert_eq!(r.stats().failed(), 1);
}
