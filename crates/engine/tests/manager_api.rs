//! Integration tests for `JobManager`.
//!
//! Jobs are driven by a scripted reporter that hands each admitted job's
//! sink to the test, so every transition happens exactly when the test
//! says so.

mod common;

use assert_matches::assert_matches;
use atelier_core::error::CoreError;
use atelier_core::generation::NewGenerationRequest;
use atelier_core::job::{GenerationError, JobFilter, JobState, ERR_REPORTER_EXITED};
use atelier_core::types::JobId;
use atelier_engine::{CancelOutcome, EngineConfig};
use atelier_events::JobEventKind;
use serde_json::json;

use common::{chat, manager_with_slots, next_event, next_run, record_events, scripted_manager, video};

// ---------------------------------------------------------------------------
// Test: submit returns a Queued snapshot with zero progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_queued_job_with_zero_progress() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let job = manager.submit(chat("hello")).unwrap();

    assert_eq!(job.state(), JobState::Queued);
    assert_eq!(job.progress(), 0);
    assert!(job.result().is_none());
    assert!(job.error().is_none());

    // Admitted right away since a slot was free.
    let run = next_run(&mut runs).await;
    assert_eq!(run.ctx.job_id, job.id());
    assert_eq!(manager.get(job.id()).unwrap().state(), JobState::Running);
}

// ---------------------------------------------------------------------------
// Test: unknown kind is rejected and nothing is stored
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_kind_is_rejected_without_side_effects() {
    let (manager, _runs) = manager_with_slots(1).await;

    let result = manager.submit(NewGenerationRequest::new("hologram", json!({"prompt": "x"})));

    assert_matches!(result, Err(CoreError::InvalidRequest(_)));
    assert!(manager.list(&JobFilter::all()).is_empty());
    assert_eq!(manager.stats().total(), 0);
}

#[tokio::test]
async fn null_parameters_are_rejected() {
    let (manager, _runs) = manager_with_slots(1).await;

    let result = manager.submit(NewGenerationRequest::new("image", serde_json::Value::Null));

    assert_matches!(result, Err(CoreError::InvalidRequest(_)));
    assert!(manager.list(&JobFilter::all()).is_empty());
}

// ---------------------------------------------------------------------------
// Test: a single slot runs jobs one at a time in submission order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_slot_runs_jobs_in_submission_order() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let first = manager.submit(video("one")).unwrap().id();
    let second = manager.submit(video("two")).unwrap().id();
    let third = manager.submit(video("three")).unwrap().id();

    let run = next_run(&mut runs).await;
    assert_eq!(run.ctx.job_id, first);
    assert_eq!(manager.get(second).unwrap().state(), JobState::Queued);
    assert_eq!(manager.get(third).unwrap().state(), JobState::Queued);

    run.sink.on_complete(json!({"url": "https://example.com/video.mp4"}));

    assert_eq!(manager.get(first).unwrap().state(), JobState::Completed);
    assert_eq!(manager.get(second).unwrap().state(), JobState::Running);
    assert_eq!(manager.get(third).unwrap().state(), JobState::Queued);

    let run = next_run(&mut runs).await;
    assert_eq!(run.ctx.job_id, second);
}

// ---------------------------------------------------------------------------
// Test: a burst never exceeds the concurrency limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_respects_concurrency_limit() {
    let (manager, mut runs) = manager_with_slots(2).await;

    for i in 0..5 {
        manager.submit(chat(&format!("prompt {i}"))).unwrap();
    }

    let stats = manager.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 3);
    assert_eq!(manager.running_count(), 2);

    let a = next_run(&mut runs).await;
    let b = next_run(&mut runs).await;
    assert_eq!((a.ctx.job_id, b.ctx.job_id), (JobId(1), JobId(2)));

    a.sink.on_complete(json!({}));
    let c = next_run(&mut runs).await;
    assert_eq!(c.ctx.job_id, JobId(3));
    assert_eq!(manager.stats().running, 2);
}

// ---------------------------------------------------------------------------
// Test: cancelling a queued job means it never starts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_queued_job_never_starts() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let first = manager.submit(chat("one")).unwrap().id();
    let second = manager.submit(chat("two")).unwrap().id();
    let third = manager.submit(chat("three")).unwrap().id();

    assert_eq!(manager.cancel(second).unwrap(), CancelOutcome::Cancelled);
    let cancelled = manager.get(second).unwrap();
    assert_eq!(cancelled.state(), JobState::Cancelled);
    assert!(cancelled.started_at().is_none());

    let run = next_run(&mut runs).await;
    assert_eq!(run.ctx.job_id, first);
    run.sink.on_complete(json!({}));

    let run = next_run(&mut runs).await;
    assert_eq!(run.ctx.job_id, third);
    assert_eq!(manager.get(second).unwrap().state(), JobState::Cancelled);
}

// ---------------------------------------------------------------------------
// Test: cancelling a running job signals its reporter and frees the slot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_running_job_frees_slot_and_ignores_late_callbacks() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let first = manager.submit(video("one")).unwrap().id();
    let second = manager.submit(video("two")).unwrap().id();
    let run = next_run(&mut runs).await;
    run.sink.on_progress(40);

    assert_eq!(manager.cancel(first).unwrap(), CancelOutcome::Cancelled);
    assert!(run.ctx.cancel.is_cancelled());
    assert_eq!(manager.get(second).unwrap().state(), JobState::Running);

    // The reporter did not notice in time.
    run.sink.on_progress(90);
    run.sink.on_complete(json!({"url": "late"}));

    let job = manager.get(first).unwrap();
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.progress(), 40);
    assert!(job.result().is_none());
}

// ---------------------------------------------------------------------------
// Test: cancelling a terminal job changes nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_on_terminal_job_is_noop() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let id = manager.submit(chat("hello")).unwrap().id();
    next_run(&mut runs).await.sink.on_complete(json!({"content": "hi"}));
    let before = manager.get(id).unwrap();

    let outcome = manager.cancel(id).unwrap();

    assert_eq!(outcome, CancelOutcome::AlreadyTerminal(JobState::Completed));
    let after = manager.get(id).unwrap();
    assert_eq!(after.state(), JobState::Completed);
    assert_eq!(after.updated_at(), before.updated_at());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (manager, _runs) = manager_with_slots(1).await;

    assert_matches!(manager.cancel(JobId(999)), Err(CoreError::NotFound(id)) if id == JobId(999));
    assert_matches!(manager.get(JobId(999)), Err(CoreError::NotFound(_)));
    assert_matches!(manager.remove(JobId(999)), Err(CoreError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Test: progress only moves forward and completion pins it at 100
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_monotonic() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let id = manager.submit(video("waves")).unwrap().id();
    let run = next_run(&mut runs).await;

    run.sink.on_progress(30);
    run.sink.on_progress(20);
    assert_eq!(manager.get(id).unwrap().progress(), 30);

    run.sink.on_progress(50);
    assert_eq!(manager.get(id).unwrap().progress(), 50);

    run.sink.on_complete(json!({"url": "https://example.com/video.mp4"}));
    let job = manager.get(id).unwrap();
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(job.progress(), 100);
    assert_eq!(job.result(), Some(&json!({"url": "https://example.com/video.mp4"})));
    assert!(job.finished_at().is_some());
}

// ---------------------------------------------------------------------------
// Test: failures are recorded on the job
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generation_failure_is_recorded_on_job() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let id = manager.submit(chat("hello")).unwrap().id();
    let run = next_run(&mut runs).await;
    run.sink.on_progress(10);
    run.sink
        .on_error(GenerationError::new("content_policy", "Prompt rejected"));

    let job = manager.get(id).unwrap();
    assert_eq!(job.state(), JobState::Failed);
    assert!(job.result().is_none());
    assert_matches!(job.error(), Some(e) if e.code == "content_policy" && e.message == "Prompt rejected");
}

#[tokio::test]
async fn dropped_sink_fails_job() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let id = manager.submit(chat("hello")).unwrap().id();
    let run = next_run(&mut runs).await;
    drop(run);

    let job = manager.get(id).unwrap();
    assert_eq!(job.state(), JobState::Failed);
    assert_matches!(job.error(), Some(e) if e.code == ERR_REPORTER_EXITED);
}

// ---------------------------------------------------------------------------
// Test: list, remove and clear
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_returns_every_job_until_cleared() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let ids: Vec<JobId> = (0..3)
        .map(|i| manager.submit(chat(&format!("prompt {i}"))).unwrap().id())
        .collect();
    let run = next_run(&mut runs).await;

    let listed: Vec<JobId> = manager.list(&JobFilter::all()).iter().map(|j| j.id()).collect();
    assert_eq!(listed, ids);
    assert_eq!(manager.list(&JobFilter::state(JobState::Queued)).len(), 2);

    assert_eq!(manager.clear(), 3);

    assert!(manager.list(&JobFilter::all()).is_empty());
    assert!(run.ctx.cancel.is_cancelled());
    assert_eq!(manager.running_count(), 0);
}

#[tokio::test]
async fn remove_cancels_and_forgets_job() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let first = manager.submit(chat("one")).unwrap().id();
    let second = manager.submit(chat("two")).unwrap().id();
    let run = next_run(&mut runs).await;

    let removed = manager.remove(first).unwrap();
    assert_eq!(removed.state(), JobState::Cancelled);
    assert!(run.ctx.cancel.is_cancelled());
    assert_matches!(manager.get(first), Err(CoreError::NotFound(_)));

    assert_eq!(next_run(&mut runs).await.ctx.job_id, second);
}

// ---------------------------------------------------------------------------
// Test: subscribers see every transition in order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_receives_lifecycle_in_order() {
    let (manager, mut runs) = manager_with_slots(1).await;
    let mut events = record_events(&manager);

    let id = manager.submit(video("waves")).unwrap().id();
    let run = next_run(&mut runs).await;
    run.sink.on_progress(40);
    run.sink.on_complete(json!({"url": "https://example.com/video.mp4"}));

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = next_event(&mut events).await;
        assert_eq!(event.job_id(), id);
        seen.push((event.event_type, event.previous_state, event.job.progress()));
    }
    assert_eq!(
        seen,
        vec![
            (JobEventKind::Submitted, None, 0),
            (JobEventKind::Started, Some(JobState::Queued), 0),
            (JobEventKind::Progress, Some(JobState::Running), 40),
            (JobEventKind::Completed, Some(JobState::Running), 100),
        ]
    );
}

#[tokio::test]
async fn subscriber_keeps_up_with_submission_burst() {
    let (manager, _runs) = manager_with_slots(1).await;
    let mut events = record_events(&manager);

    let ids: Vec<JobId> = (0..100)
        .map(|i| manager.submit(chat(&format!("prompt {i}"))).unwrap().id())
        .collect();
    manager.cancel(ids[99]).unwrap();

    // 100 submissions, one admission, one cancellation.
    let mut kinds = Vec::new();
    for _ in 0..102 {
        kinds.push(next_event(&mut events).await.event_type);
    }
    assert_eq!(kinds.iter().filter(|k| **k == JobEventKind::Submitted).count(), 100);
    assert_eq!(kinds.iter().filter(|k| **k == JobEventKind::Started).count(), 1);
    assert_eq!(kinds.last(), Some(&JobEventKind::Cancelled));
}

#[tokio::test]
async fn unsubscribe_is_reported_once() {
    let (manager, _runs) = manager_with_slots(1).await;

    let handle = manager.subscribe(|_| {});

    assert!(manager.unsubscribe(handle));
    assert!(!manager.unsubscribe(handle));
}

// ---------------------------------------------------------------------------
// Test: waiting for a job to finish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_until_terminal_returns_final_snapshot() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let id = manager.submit(chat("hello")).unwrap().id();
    let waiter = tokio::spawn({
        let manager = manager.clone();
        async move { manager.wait_until_terminal(id).await }
    });

    let run = next_run(&mut runs).await;
    tokio::task::yield_now().await;
    run.sink.on_complete(json!({"content": "hi"}));

    let job = waiter.await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Completed);
}

// ---------------------------------------------------------------------------
// Test: strict parameter rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn strict_rules_require_per_kind_fields() {
    let config = EngineConfig {
        strict_parameters: true,
        ..EngineConfig::default()
    };
    let (manager, _runs) = scripted_manager(config).await;

    assert_matches!(manager.submit(chat("   ")), Err(CoreError::InvalidRequest(_)));
    assert_matches!(
        manager.submit(NewGenerationRequest::new("music", json!({"genre": "jazz"}))),
        Err(CoreError::InvalidRequest(_))
    );
    assert!(manager.list(&JobFilter::all()).is_empty());

    manager
        .submit(NewGenerationRequest::new("ppt", json!({"title": "Quarterly review"})))
        .unwrap();
    assert_eq!(manager.list(&JobFilter::all()).len(), 1);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let reporter = std::sync::Arc::new(common::ScriptedReporter::new(tx));

    let config = EngineConfig::default().with_max_concurrent(0);

    let result = atelier_engine::JobManager::start(config, reporter).await;

    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Test: shutdown cancels active work and refuses new submissions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_cancels_active_jobs() {
    let (manager, mut runs) = manager_with_slots(1).await;

    let first = manager.submit(chat("one")).unwrap().id();
    let second = manager.submit(chat("two")).unwrap().id();
    let run = next_run(&mut runs).await;

    manager.shutdown().await;

    assert!(run.ctx.cancel.is_cancelled());
    assert_eq!(manager.get(first).unwrap().state(), JobState::Cancelled);
    assert_eq!(manager.get(second).unwrap().state(), JobState::Cancelled);
    assert_matches!(manager.submit(chat("three")), Err(CoreError::Internal(_)));
}
