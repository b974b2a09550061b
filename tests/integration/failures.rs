//! Retries, permanent failures, cascades and timeouts.

use std::collections::HashSet;
use std::time::Duration;

use kiln::core::task::{TaskId, TaskStatus};
use kiln::orchestration::{EventKind, OrchestratorState};

use crate::fixtures::{drain, orchestrator, task, test_config, Behavior, ScriptedGenerator};

// ========== Retry Tests ==========

/// Given a task with three attempts that always fails
/// When the build runs
/// Then it is tried exactly three times and ends failed
#[tokio::test]
async fn test_always_failing_task_stops_after_max_attempts() {
    let generator = ScriptedGenerator::new().with("a", Behavior::AlwaysFail);
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![task("a", &[]).with_max_attempts(3)])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let result = orch.orchestrate().await.unwrap();
    assert_eq!(result.status, OrchestratorState::Failed);
    assert_eq!(generator.calls("a"), 3);
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(result.failed[0].id, TaskId::from("a"));
    assert_eq!(result.failed[0].attempts, 3);
    assert!(result.failed[0].error.contains("scripted failure"));

    let failures: Vec<(u32, bool)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EventKind::TaskFailed {
                attempt,
                will_retry,
                ..
            } => Some((attempt, will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(1, true), (2, true), (3, false)]);
}

#[tokio::test]
async fn test_flaky_task_succeeds_on_retry() {
    let generator = ScriptedGenerator::new().with("a", Behavior::FailTimes(2));
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &["a"])])
        .await
        .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert_eq!(generator.calls("a"), 3);
    assert_eq!(generator.calls("b"), 1);

    let graph = orch.graph_snapshot().await;
    let a = graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.attempts, 3);
    assert_eq!(a.last_error.as_deref(), Some("Generation failed: scripted failure 2"));
}

#[tokio::test]
async fn test_per_task_attempts_override_default() {
    let generator = ScriptedGenerator::new().with("once", Behavior::AlwaysFail);
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("once", &[]).with_max_attempts(1)])
        .await
        .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert_eq!(result.status, OrchestratorState::Failed);
    assert_eq!(generator.calls("once"), 1);
}

// ========== Cascade Tests ==========

/// Given X failing with Y and Z downstream and W independent
/// When the build runs
/// Then Y and Z end blocked, W completes and the graph is terminal
#[tokio::test]
async fn test_failure_blocks_transitive_dependents() {
    let generator = ScriptedGenerator::new().with("x", Behavior::AlwaysFail);
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![
        task("x", &[]),
        task("y", &["x"]),
        task("z", &["y"]),
        task("w", &[]),
    ])
    .await
    .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert_eq!(result.status, OrchestratorState::Failed);
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(result.score, 25.0);

    let blocked: HashSet<TaskId> = result.blocked.iter().map(|b| b.id.clone()).collect();
    assert_eq!(
        blocked,
        HashSet::from([TaskId::from("y"), TaskId::from("z")])
    );
    assert_eq!(generator.calls("y"), 0);
    assert_eq!(generator.calls("z"), 0);

    let graph = orch.graph_snapshot().await;
    assert!(graph.has_failed());
    assert!(graph.is_complete());
    assert_eq!(
        graph.get_task(&TaskId::from("w")).unwrap().status,
        TaskStatus::Completed
    );
    assert!(matches!(
        graph.get_task(&TaskId::from("z")).unwrap().status,
        TaskStatus::Blocked { .. }
    ));
}

#[tokio::test]
async fn test_cascade_emits_blocked_events() {
    let generator = ScriptedGenerator::new().with("x", Behavior::AlwaysFail);
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("x", &[]).with_max_attempts(1), task("y", &["x"])])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    orch.orchestrate().await.unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EventKind::TaskBlocked { task_id, .. } if task_id.as_str() == "y"
    )));
    assert!(matches!(events.last(), Some(EventKind::Failed { .. })));
}

// ========== Timeout Tests ==========

#[tokio::test]
async fn test_hung_task_times_out_and_fails() {
    let generator = ScriptedGenerator::new().with("slow", Behavior::Hang);
    let mut config = test_config(1);
    config.queue.task_timeout = Duration::from_millis(50);
    let orch = orchestrator(config, &generator);
    orch.add_tasks(vec![task("slow", &[]).with_max_attempts(2), task("after", &["slow"])])
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), orch.orchestrate())
        .await
        .expect("build should not hang")
        .unwrap();
    assert_eq!(result.status, OrchestratorState::Failed);
    assert_eq!(result.failed.len(), 1);
    assert!(result.failed[0].error.contains("timed out"));
    assert_eq!(result.blocked.len(), 1);
    assert_eq!(generator.calls("slow"), 2);
    assert_eq!(generator.calls("after"), 0);
}

/// Given a hung task with two attempts and a sweeper that rarely runs
/// When each attempt hits the task timeout inside the worker
/// Then every timed-out attempt is announced exactly once
#[tokio::test]
async fn test_timeout_event_for_each_attempt() {
    let generator = ScriptedGenerator::new().with("slow", Behavior::Hang);
    let mut config = test_config(1);
    config.queue.task_timeout = Duration::from_millis(50);
    config.sweep_interval = Duration::from_secs(1);
    let orch = orchestrator(config, &generator);
    orch.add_tasks(vec![task("slow", &[]).with_max_attempts(2)])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let result = tokio::time::timeout(Duration::from_secs(10), orch.orchestrate())
        .await
        .expect("build should not hang")
        .unwrap();
    assert_eq!(result.status, OrchestratorState::Failed);

    let events = drain(&mut rx);
    let timeouts = events
        .iter()
        .filter(|e| matches!(e, EventKind::TaskTimeout { task_id, .. } if task_id.as_str() == "slow"))
        .count();
    let failures = events
        .iter()
        .filter(|e| matches!(e, EventKind::TaskFailed { .. }))
        .count();
    assert_eq!(timeouts, 2);
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn test_timeout_event_not_duplicated_with_fast_sweeper() {
    let generator = ScriptedGenerator::new().with("slow", Behavior::Hang);
    let mut config = test_config(2);
    config.queue.task_timeout = Duration::from_millis(50);
    let orch = orchestrator(config, &generator);
    orch.add_tasks(vec![task("slow", &[]).with_max_attempts(2)])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    tokio::time::timeout(Duration::from_secs(10), orch.orchestrate())
        .await
        .expect("build should not hang")
        .unwrap();

    let timeouts = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EventKind::TaskTimeout { .. }))
        .count();
    assert_eq!(timeouts, 2);
}
