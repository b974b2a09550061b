//! Dependency ordering, parallel execution and work stealing.

use std::time::Duration;

use kiln::core::task::{TaskId, TaskStatus, WorkerId};
use kiln::orchestration::{EventKind, OrchestratorState, QueueConfig, QueuedTask, WorkStealingQueue};

use crate::fixtures::{
    diamond, drain, independent, orchestrator, position, task, test_config, Behavior,
    ScriptedGenerator,
};

fn started(id: &str) -> impl Fn(&EventKind) -> bool + '_ {
    move |e| matches!(e, EventKind::TaskStarted { task_id, .. } if task_id.as_str() == id)
}

fn completed(id: &str) -> impl Fn(&EventKind) -> bool + '_ {
    move |e| matches!(e, EventKind::TaskCompleted { task_id, .. } if task_id.as_str() == id)
}

// ========== Ordering Tests ==========

/// Given A and B without dependencies and C depending on both
/// When two workers run the build
/// Then C starts only after A and B completed
#[tokio::test]
async fn test_join_waits_for_both_dependencies() {
    let generator = ScriptedGenerator::new()
        .with("a", Behavior::Delay(Duration::from_millis(30)))
        .with("b", Behavior::Delay(Duration::from_millis(60)));
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.tasks_completed, 3);

    let events = drain(&mut rx);
    let c_start = position(&events, started("c")).unwrap();
    assert!(position(&events, completed("a")).unwrap() < c_start);
    assert!(position(&events, completed("b")).unwrap() < c_start);
    assert_eq!(generator.calls("c"), 1);
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(3), &generator);
    orch.add_tasks(diamond()).await.unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());

    let order = generator.started();
    let at = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
    assert_eq!(at("a"), 0);
    assert!(at("b") < at("d"));
    assert!(at("c") < at("d"));

    let graph = orch.graph_snapshot().await;
    assert!(graph.is_complete());
    assert!(!graph.has_failed());
    assert!(graph
        .all_tasks()
        .iter()
        .all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn test_phase_events_follow_plan() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(diamond()).await.unwrap();
    let mut rx = orch.subscribe();

    orch.orchestrate().await.unwrap();

    let phases: Vec<usize> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EventKind::PhaseCompleted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![0, 1, 2]);
}

// ========== Priority Tests ==========

/// Given three independent tasks with different priorities
/// When a single worker runs the build
/// Then the most urgent task starts first and the least urgent last
#[tokio::test]
async fn test_single_worker_runs_most_urgent_first() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![
        task("lazy", &[]).with_priority(9),
        task("urgent", &[]).with_priority(0),
        task("middle", &[]).with_priority(5),
    ])
    .await
    .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert_eq!(
        generator.started(),
        vec![
            TaskId::from("urgent"),
            TaskId::from("middle"),
            TaskId::from("lazy")
        ]
    );
}

/// Given a waiting task in the overflow queue and a retry queued behind it
/// When an idle worker picks from the overflow queue
/// Then the boosted retry goes first
#[test]
fn test_retry_boost_moves_task_ahead() {
    let mut queue = WorkStealingQueue::new(QueueConfig::with_workers(2));
    queue.submit_to(WorkerId(0), queued("steady")).unwrap();
    queue.submit_to(WorkerId(0), queued("flaky")).unwrap();
    let first = queue.acquire_task(WorkerId(0)).unwrap();
    assert_eq!(first.task_id, TaskId::from("flaky"));

    queue.deactivate(WorkerId(0));
    queue.fail_task(&first.task_id, WorkerId(0), "flaked").unwrap();
    assert_eq!(queue.global_len(), 2);

    let retry = queue.acquire_task(WorkerId(1)).unwrap();
    assert_eq!(retry.task_id, TaskId::from("flaky"));
    assert_eq!(retry.priority, 4);
    assert_eq!(retry.attempt, 2);
    let next = queue.acquire_task(WorkerId(1)).unwrap();
    assert_eq!(next.task_id, TaskId::from("steady"));
}

// ========== Parallelism Tests ==========

#[tokio::test]
async fn test_independent_tasks_run_concurrently() {
    let mut generator = ScriptedGenerator::new();
    for i in 0..4 {
        generator = generator.with(&format!("t{}", i), Behavior::Delay(Duration::from_millis(50)));
    }
    let orch = orchestrator(test_config(4), &generator);
    orch.add_tasks(independent(4)).await.unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert!(generator.max_running() >= 2);
    assert_eq!(result.workers.len(), 4);
    let total: u64 = result.workers.iter().map(|w| w.tasks_completed).sum();
    assert_eq!(total, 4);
}

#[tokio::test]
async fn test_single_worker_runs_serially() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(independent(5)).await.unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert_eq!(result.status, OrchestratorState::Completed);
    assert_eq!(result.tasks_completed, 5);
    assert_eq!(generator.max_running(), 1);
    assert_eq!(result.steal_count, 0);
}

#[tokio::test]
async fn test_status_reports_progress_after_build() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(diamond()).await.unwrap();
    orch.orchestrate().await.unwrap();

    let status = orch.status().await;
    assert_eq!(status.state, OrchestratorState::Completed);
    assert_eq!(status.progress.completed, 4);
    assert_eq!(status.progress.total, 4);
    assert_eq!(status.progress.percent, 100.0);
    assert_eq!(status.counts.completed, 4);
}

// ========== Work Stealing Tests ==========

fn queued(id: &str) -> QueuedTask {
    QueuedTask::new(TaskId::from(id), Vec::new(), 5, 3)
}

/// Given one worker holding four tasks and another holding one
/// When the lightly loaded worker runs out
/// Then it steals from the busy worker and the steal counter moves
#[test]
fn test_idle_worker_steals_from_loaded_worker() {
    let mut queue = WorkStealingQueue::new(QueueConfig::with_workers(2));
    for id in ["t0", "t1", "t2", "t3"] {
        queue.submit_to(WorkerId(0), queued(id)).unwrap();
    }
    queue.submit_to(WorkerId(1), queued("t4")).unwrap();

    let own = queue.acquire_task(WorkerId(1)).unwrap();
    assert_eq!(own.task_id, TaskId::from("t4"));
    assert!(own.stolen_from.is_none());

    let stolen = queue.acquire_task(WorkerId(1)).unwrap();
    assert_eq!(stolen.stolen_from, Some(WorkerId(0)));
    assert_eq!(stolen.task_id, TaskId::from("t0"));
    assert_eq!(stolen.priority, 4);
    assert!(queue.steal_count() > 0);
    assert_eq!(queue.lock_holder(&TaskId::from("t0")), Some(WorkerId(1)));

    // The victim keeps working newest-first from what is left.
    let next = queue.acquire_task(WorkerId(0)).unwrap();
    assert_eq!(next.task_id, TaskId::from("t3"));
}

#[test]
fn test_no_steal_from_worker_at_threshold() {
    let mut queue = WorkStealingQueue::new(QueueConfig::with_workers(2));
    queue.submit_to(WorkerId(0), queued("t0")).unwrap();
    queue.submit_to(WorkerId(0), queued("t1")).unwrap();

    assert!(queue.acquire_task(WorkerId(1)).is_none());
    assert_eq!(queue.steal_count(), 0);
}

#[test]
fn test_stolen_task_completes_for_thief() {
    let mut queue = WorkStealingQueue::new(QueueConfig::with_workers(2));
    for id in ["t0", "t1", "t2"] {
        queue.submit_to(WorkerId(0), queued(id)).unwrap();
    }

    let stolen = queue.acquire_task(WorkerId(1)).unwrap();
    assert!(stolen.stolen_from.is_some());
    assert!(queue.complete_task(&stolen.task_id, WorkerId(0)).is_err());
    queue.complete_task(&stolen.task_id, WorkerId(1)).unwrap();
    assert!(queue.is_completed(&stolen.task_id));

    let stats = queue.worker_stats();
    assert_eq!(stats[0].stolen_from, 1);
    assert_eq!(stats[1].tasks_completed, 1);
}
