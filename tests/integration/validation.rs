//! Graph validation before and during a build.

use std::time::Duration;

use tempfile::TempDir;

use kiln::core::dag::{DependencyGraph, ValidationIssue};
use kiln::core::task::{Task, TaskId};
use kiln::manifest;
use kiln::orchestration::OrchestratorState;
use kiln::Error;

use crate::fixtures::{orchestrator, task, test_config, Behavior, ScriptedGenerator};

fn graph_of(specs: Vec<kiln::TaskSpec>) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    graph
        .add_tasks(specs.into_iter().map(|s| Task::from_spec(s, 3)))
        .unwrap();
    graph
}

// ========== Cycle Tests ==========

/// Given A depending on B and B depending on A
/// When the graph is validated and ordered
/// Then validation reports the cycle and ordering fails instead of looping
#[test]
fn test_two_task_cycle_is_reported() {
    let mut graph = graph_of(vec![task("a", &["b"]), task("b", &["a"])]);

    let report = graph.validate();
    assert!(!report.valid);
    let cycle = report.cycle().unwrap();
    assert_eq!(cycle.first(), cycle.last());
    assert!(cycle.contains(&TaskId::from("a")));
    assert!(cycle.contains(&TaskId::from("b")));

    assert!(matches!(
        graph.execution_order(),
        Err(Error::CycleDetected { .. })
    ));
    tokio_test::assert_err!(graph.execution_plan());
}

#[tokio::test]
async fn test_cyclic_build_aborts_before_running() {
    let generator = ScriptedGenerator::new();
    let orch = orchestrator(test_config(2), &generator);
    orch.add_tasks(vec![
        task("a", &["c"]),
        task("b", &["a"]),
        task("c", &["b"]),
    ])
    .await
    .unwrap();

    let err = orch.orchestrate().await.unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    assert_eq!(orch.state(), OrchestratorState::Failed);
    assert!(generator.started().is_empty());
}

#[test]
fn test_dangling_reference_is_reported() {
    let mut graph = graph_of(vec![task("a", &[]), task("b", &["a", "ghost"])]);
    let report = graph.validate();
    assert!(!report.valid);
    assert_eq!(
        report.issues,
        vec![ValidationIssue::DanglingReference {
            task: TaskId::from("b"),
            dependency: TaskId::from("ghost"),
        }]
    );
    assert!(matches!(
        report.into_result(),
        Err(Error::DanglingDependency { .. })
    ));
}

// ========== Incremental Validation Tests ==========

#[tokio::test]
async fn test_mid_build_cycle_is_rejected() {
    let generator =
        ScriptedGenerator::new().with("a", Behavior::Delay(Duration::from_millis(150)));
    let orch = orchestrator(test_config(1), &generator);
    orch.add_tasks(vec![task("a", &[])]).await.unwrap();

    let runner = tokio::spawn({
        let orch = orch.clone();
        async move { orch.orchestrate().await }
    });
    generator.wait_started("a").await;

    let err = orch
        .add_tasks(vec![task("x", &["y"]), task("y", &["x"])])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));

    let err = orch
        .add_tasks(vec![task("z", &["missing"])])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DanglingDependency { .. }));
    assert_eq!(orch.graph_snapshot().await.task_count(), 1);

    let result = runner.await.unwrap().unwrap();
    assert!(result.is_success());
    assert_eq!(result.tasks_completed, 1);
}

// ========== Manifest Tests ==========

#[test]
fn test_manifest_feeds_valid_plan() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(
        &path,
        r#"{"tasks": [
            {"id": "setup", "type": "scaffold", "file_path": "package.json"},
            {"id": "types", "type": "types", "file_path": "src/types.ts", "dependencies": ["setup"]},
            {"id": "button", "file_path": "src/Button.tsx", "dependencies": ["types"]},
            {"id": "card", "file_path": "src/Card.tsx", "dependencies": ["types"]}
        ]}"#,
    )
    .unwrap();

    let mut graph = graph_of(manifest::load(&path).unwrap());
    assert!(graph.validate().valid);

    let plan = graph.execution_plan().unwrap();
    assert_eq!(plan.phases.len(), 3);
    assert_eq!(plan.phases[2].tasks.len(), 2);
    assert_eq!(plan.critical_path.first(), Some(&TaskId::from("setup")));
    assert_eq!(plan.critical_path.len(), 3);
}
