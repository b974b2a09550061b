//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted code generator with per-task behavior
//! - Orchestrators wired to in-process collaborators
//! - Predefined task sets

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use kiln::core::task::{Task, TaskId, TaskSpec, TaskType};
use kiln::orchestration::{
    BuildEvent, CodeGenerator, EventKind, GenerationOutput, NoopVerifier, Orchestrator,
    OrchestratorConfig, QueueConfig, Sandbox,
};
use kiln::Result;

/// How the scripted generator treats one task.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Succeed,
    /// Fail the first `n` attempts, then succeed.
    FailTimes(u32),
    AlwaysFail,
    /// Succeed after sleeping.
    Delay(Duration),
    /// Never return on its own.
    Hang,
}

#[derive(Debug, Default)]
pub struct GenerationLog {
    pub started: Vec<TaskId>,
    pub finished: Vec<TaskId>,
    pub calls: HashMap<TaskId, u32>,
    pub running: usize,
    pub max_running: usize,
}

/// Code generator whose behavior is scripted per task.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    behaviors: HashMap<TaskId, Behavior>,
    log: Arc<Mutex<GenerationLog>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(TaskId::from(id), behavior);
        self
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn calls(&self, id: &str) -> u32 {
        self.log
            .lock()
            .unwrap()
            .calls
            .get(&TaskId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn max_running(&self) -> usize {
        self.log.lock().unwrap().max_running
    }

    /// Wait until `id` has started at least once.
    pub async fn wait_started(&self, id: &str) {
        let id = TaskId::from(id);
        for _ in 0..500 {
            if self.log.lock().unwrap().started.contains(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never started", id);
    }
}

/// Decrements the running count even when the attempt is dropped mid-flight.
struct Running(Arc<Mutex<GenerationLog>>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.lock().unwrap().running -= 1;
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn execute(&self, task: &Task, _claimed: &[PathBuf]) -> Result<GenerationOutput> {
        let call = {
            let mut log = self.log.lock().unwrap();
            log.started.push(task.id.clone());
            log.running += 1;
            log.max_running = log.max_running.max(log.running);
            let calls = log.calls.entry(task.id.clone()).or_insert(0);
            *calls += 1;
            *calls
        };
        let _running = Running(self.log.clone());

        let behavior = self
            .behaviors
            .get(&task.id)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        let output = match behavior {
            Behavior::Succeed => GenerationOutput::success(vec![task.file_path.clone()]),
            Behavior::FailTimes(n) if call <= n => {
                GenerationOutput::failure(format!("scripted failure {}", call))
            }
            Behavior::FailTimes(_) => GenerationOutput::success(vec![task.file_path.clone()]),
            Behavior::AlwaysFail => GenerationOutput::failure("scripted failure"),
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                GenerationOutput::success(vec![task.file_path.clone()])
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                GenerationOutput::failure("hang ended")
            }
        };

        self.log.lock().unwrap().finished.push(task.id.clone());
        Ok(output)
    }
}

pub struct ReadySandbox;

#[async_trait]
impl Sandbox for ReadySandbox {
    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }
}

/// Fast-polling config for tests.
pub fn test_config(workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        queue: QueueConfig::with_workers(workers),
        poll_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn orchestrator(config: OrchestratorConfig, generator: &ScriptedGenerator) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        config,
        Arc::new(generator.clone()),
        Arc::new(NoopVerifier),
        Arc::new(ReadySandbox),
    ))
}

/// A component task writing `src/<id>.tsx`.
pub fn task(id: &str, deps: &[&str]) -> TaskSpec {
    TaskSpec::new(id, TaskType::Component, &format!("src/{}.tsx", id)).with_dependencies(deps)
}

/// Create a diamond: a -> (b, c) -> d
pub fn diamond() -> Vec<TaskSpec> {
    vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
    ]
}

/// Create `n` tasks without dependencies.
pub fn independent(n: usize) -> Vec<TaskSpec> {
    (0..n).map(|i| task(&format!("t{}", i), &[])).collect()
}

/// Everything currently buffered on an event receiver.
pub fn drain(rx: &mut broadcast::Receiver<BuildEvent>) -> Vec<EventKind> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.kind);
    }
    events
}

/// Position of the first event matching `pred`.
pub fn position(events: &[EventKind], pred: impl Fn(&EventKind) -> bool) -> Option<usize> {
    events.iter().position(pred)
}
