//! Pause, resume, cancel, incremental submission, events and file claims.

use std::time::Duration;

use kiln::core::task::{TaskId, TaskSpec, TaskStatus, TaskType};
use kiln::orchestration::{EventKind, OrchestratorState};
use kiln::Error;

use crate::fixtures::{drain, orchestrator, task, test_config, Behavior, ScriptedGenerator};

// ========== Pause / Resume Tests ==========

#[tokio::test]
async fn test_pause_holds_new_work_until_resume() {
    let generator =
        ScriptedGenerator::new().with("a", Behavior::Delay(Duration::from_millis(100)));
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let runner = tokio::spawn({
        let orch = orch.clone();
        async move { orch.orchestrate().await }
    });
    generator.wait_started("a").await;
    tokio_test::assert_ok!(orch.pause());
    assert_eq!(orch.state(), OrchestratorState::Paused);
    assert!(orch.pause().is_err());

    // The in-flight attempt finishes; nothing new starts.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(generator.started(), vec![TaskId::from("a")]);
    let status = orch.status().await;
    assert_eq!(status.state, OrchestratorState::Paused);
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.counts.ready, 2);

    tokio_test::assert_ok!(orch.resume());
    let result = runner.await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(result.tasks_completed, 3);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, EventKind::Paused)));
    assert!(events.iter().any(|e| matches!(e, EventKind::Resumed)));
}

// ========== Cancel Tests ==========

#[tokio::test]
async fn test_cancel_abandons_in_flight_tasks() {
    let generator = ScriptedGenerator::new()
        .with("a", Behavior::Hang)
        .with("b", Behavior::Hang);
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &[]), task("c", &["a"])])
        .await
        .unwrap();

    let runner = tokio::spawn({
        let orch = orch.clone();
        async move { orch.orchestrate().await }
    });
    generator.wait_started("a").await;
    generator.wait_started("b").await;
    assert_eq!(orch.claims().len(), 2);

    orch.cancel();
    assert_eq!(orch.state(), OrchestratorState::Cancelled);

    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancelled build should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, OrchestratorState::Cancelled);
    assert!(!result.is_success());
    assert_eq!(result.tasks_completed, 0);
    assert!(orch.claims().is_empty());

    let graph = orch.graph_snapshot().await;
    let a = graph.get_task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Ready);
    assert_eq!(a.last_error, Some(Error::Cancelled.to_string()));
    assert_eq!(
        graph.get_task(&TaskId::from("c")).unwrap().status,
        TaskStatus::Pending
    );

    assert!(matches!(
        orch.add_tasks(vec![task("late", &[])]).await,
        Err(Error::InvalidState(_))
    ));
    orch.cancel();
    assert_eq!(orch.state(), OrchestratorState::Cancelled);
}

// ========== Incremental Submission Tests ==========

#[tokio::test]
async fn test_tasks_added_mid_build_run() {
    let generator =
        ScriptedGenerator::new().with("a", Behavior::Delay(Duration::from_millis(100)));
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![task("a", &[])]).await.unwrap();

    let runner = tokio::spawn({
        let orch = orch.clone();
        async move { orch.orchestrate().await }
    });
    generator.wait_started("a").await;

    let ids = orch
        .add_tasks(vec![task("b", &["a"]), task("solo", &[])])
        .await
        .unwrap();
    assert_eq!(ids, vec![TaskId::from("b"), TaskId::from("solo")]);
    assert!(orch.add_tasks(vec![task("a", &[])]).await.is_err());

    let result = runner.await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(result.tasks_completed, 3);

    let order = generator.started();
    let at = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
    assert!(at("a") < at("b"));
}

/// Given a chain whose first phase already completed
/// When a new root task is added while the second phase runs
/// Then progress points back at the first phase until the new task finishes
#[tokio::test]
async fn test_root_task_added_late_reopens_first_phase() {
    let generator =
        ScriptedGenerator::new().with("b", Behavior::Delay(Duration::from_millis(200)));
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &["a"])])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    let runner = tokio::spawn({
        let orch = orch.clone();
        async move { orch.orchestrate().await }
    });
    generator.wait_started("b").await;

    orch.add_tasks(vec![task("late", &[])]).await.unwrap();
    let plan = orch.graph_snapshot().await.execution_plan().unwrap();
    assert!(plan.phases[0].tasks.contains(&TaskId::from("late")));
    let status = orch.status().await;
    assert_eq!(status.progress.current_phase, Some(plan.phases[0].name.clone()));

    let result = runner.await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(result.tasks_completed, 3);
    assert_eq!(orch.status().await.progress.current_phase, None);

    let completed: Vec<usize> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            EventKind::PhaseCompleted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(completed.last(), Some(&1));
}

// ========== Event Stream Tests ==========

#[tokio::test]
async fn test_event_stream_for_chain() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("a", &[]), task("b", &["a"])])
        .await
        .unwrap();
    let mut rx = orch.subscribe();

    orch.orchestrate().await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.build_id, orch.build_id());
        events.push(event.kind);
    }

    assert!(matches!(
        events.first(),
        Some(EventKind::PhaseStarted { index: 0, .. })
    ));
    assert!(matches!(events.last(), Some(EventKind::Completed { score }) if *score == 100.0));
    assert!(events.iter().any(|e| matches!(
        e,
        EventKind::TaskReady { task_id } if task_id.as_str() == "b"
    )));
    let completions = events
        .iter()
        .filter(|e| matches!(e, EventKind::TaskCompleted { .. }))
        .count();
    assert_eq!(completions, 2);
}

// ========== File Claim Tests ==========

/// Given two independent tasks writing the same file
/// When two workers are free
/// Then the claims serialize them
#[tokio::test]
async fn test_same_file_tasks_never_overlap() {
    let generator = ScriptedGenerator::new()
        .with("one", Behavior::Delay(Duration::from_millis(50)))
        .with("two", Behavior::Delay(Duration::from_millis(50)));
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![
        TaskSpec::new("one", TaskType::Component, "src/Shared.tsx"),
        TaskSpec::new("two", TaskType::Style, "src/Shared.tsx"),
    ])
    .await
    .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert_eq!(generator.max_running(), 1);
    assert!(orch.claims().is_empty());
}

#[tokio::test]
async fn test_scaffold_claims_its_directory() {
    let generator = ScriptedGenerator::new()
        .with("setup", Behavior::Delay(Duration::from_millis(50)))
        .with("page", Behavior::Delay(Duration::from_millis(50)));
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![
        TaskSpec::new("setup", TaskType::Scaffold, "app/package.json"),
        TaskSpec::new("page", TaskType::Page, "app/src/index.tsx"),
    ])
    .await
    .unwrap();

    let result = orch.orchestrate().await.unwrap();
    assert!(result.is_success());
    assert_eq!(generator.max_running(), 1);
}
