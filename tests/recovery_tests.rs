//! Startup recovery and the parent auto-resume guard.

mod common;

use common::{ROOT, create_params, report_ending, setup, setup_with, test_config};
use std::sync::atomic::Ordering;
use task_orchestrator::interfaces::StreamEnded;
use task_orchestrator::{ErrorCode, TaskStatus};

#[tokio::test]
async fn restart_reissues_exactly_one_reminder_to_awaiting_report_task() {
    let h = setup();
    let task = h
        .orch
        .create_task(create_params(ROOT, "worker"))
        .await
        .unwrap()
        .record()
        .clone();
    h.orch
        .handle_stream_ended(&task.id, StreamEnded::default())
        .await
        .unwrap();
    assert_eq!(
        h.orch.task_status(&task.id).unwrap(),
        Some(TaskStatus::AwaitingReport)
    );

    // "Restart": wipe the send log, then recover.
    h.streams.sent.lock().unwrap().clear();
    h.orch.recover_on_startup().await.unwrap();

    let sent = h.streams.sent_to(&task.id);
    assert_eq!(sent.len(), 1, "exactly one recovery message");
    assert!(sent[0].contains("report"), "it nudges toward the report tool");
}

#[tokio::test]
async fn restart_resumes_running_task_without_active_descendants() {
    let h = setup();
    let task = h
        .orch
        .create_task(create_params(ROOT, "worker"))
        .await
        .unwrap()
        .record()
        .clone();

    h.streams.sent.lock().unwrap().clear();
    h.orch.recover_on_startup().await.unwrap();
    assert_eq!(h.streams.sent_to(&task.id).len(), 1);
}

#[tokio::test]
async fn restart_leaves_tasks_with_active_descendants_alone() {
    let h = setup();
    let a = h
        .orch
        .create_task(create_params(ROOT, "worker"))
        .await
        .unwrap()
        .record()
        .clone();
    let b = h
        .orch
        .create_task(create_params(&a.id, "worker"))
        .await
        .unwrap()
        .record()
        .clone();

    h.streams.sent.lock().unwrap().clear();
    h.orch.recover_on_startup().await.unwrap();

    // Only the leaf gets a nudge; the parent's child report will wake it.
    assert!(h.streams.sent_to(&a.id).is_empty());
    assert_eq!(h.streams.sent_to(&b.id).len(), 1);
}

#[tokio::test]
async fn restart_retries_pending_artifact_then_cleans_up() {
    let h = setup();
    let task = h
        .orch
        .create_task(create_params(ROOT, "worker"))
        .await
        .unwrap()
        .record()
        .clone();

    h.artifacts.fail.store(true, Ordering::SeqCst);
    h.orch
        .handle_stream_ended(&task.id, report_ending("done"))
        .await
        .unwrap();
    let record = h.orch.get_task(&task.id).unwrap().unwrap();
    assert!(record.artifact_pending, "generation failed, flag retained");

    h.artifacts.fail.store(false, Ordering::SeqCst);
    h.orch.recover_on_startup().await.unwrap();

    // Generation succeeded on retry and the finished leaf was reduced away.
    assert!(h.orch.get_task(&task.id).unwrap().is_none());
    assert!(h.artifacts.generated.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.orch.reports_for_session(ROOT).unwrap().len(), 1);
}

#[tokio::test]
async fn restart_dequeues_waiting_tasks() {
    let mut config = test_config();
    config.max_parallel_agent_tasks = 1;
    let h = setup_with(config.clone());

    let _running = h.orch.create_task(create_params(ROOT, "worker")).await.unwrap();
    let queued = h
        .orch
        .create_task(create_params(ROOT, "worker"))
        .await
        .unwrap()
        .record()
        .clone();
    assert_eq!(queued.status, TaskStatus::Queued);

    // The operator raised the cap before the restart.
    config.max_parallel_agent_tasks = 2;
    h.orch.update_config(config);
    h.orch.recover_on_startup().await.unwrap();

    let record = h.orch.get_task(&queued.id).unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Running);
    assert_eq!(h.streams.sent_to(&queued.id), vec!["do the thing".to_string()]);
}

#[tokio::test]
async fn auto_resume_guard_stops_at_the_ceiling() {
    let h = setup();
    let _task = h.orch.create_task(create_params(ROOT, "worker")).await.unwrap();

    for _ in 0..3 {
        assert!(h.orch.handle_parent_turn_ended(ROOT).await.unwrap());
    }
    let err = h.orch.handle_parent_turn_ended(ROOT).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AutoResumeStuck);

    // A genuine user message resets the guard.
    h.orch.reset_auto_resume_count(ROOT).unwrap();
    assert!(h.orch.handle_parent_turn_ended(ROOT).await.unwrap());
}

#[tokio::test]
async fn auto_resume_is_a_noop_without_active_descendants() {
    let h = setup();
    assert!(!h.orch.handle_parent_turn_ended(ROOT).await.unwrap());
    assert!(h.streams.sent_to(ROOT).is_empty());
}

#[tokio::test]
async fn hard_interrupt_suppresses_auto_resume_until_reset() {
    let h = setup();
    let _task = h.orch.create_task(create_params(ROOT, "worker")).await.unwrap();

    h.orch.mark_parent_session_hard_interrupted(ROOT).unwrap();
    assert!(!h.orch.handle_parent_turn_ended(ROOT).await.unwrap());
    assert!(h.streams.sent_to(ROOT).is_empty());

    h.orch.reset_auto_resume_count(ROOT).unwrap();
    assert!(h.orch.handle_parent_turn_ended(ROOT).await.unwrap());
    assert_eq!(h.streams.sent_to(ROOT).len(), 1);
}
