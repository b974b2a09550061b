//! Build orchestrator.
//!
//! The [`Orchestrator`] owns the dependency graph and the work-stealing
//! queue behind a single mutex and drives a fixed pool of worker loops over
//! them. Workers take the lock only to acquire a task or report its outcome;
//! generation and verification run with the lock released.
//!
//! State machine: `initializing -> running -> (paused <-> running) ->
//! completed | failed | cancelled`.

use crate::core::dag::{DependencyGraph, StatusCounts};
use crate::core::plan::ExecutionPlan;
use crate::core::task::{Task, TaskId, TaskOutput, TaskSpec, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::claims::{FileClaims, DEFAULT_CLAIM_TIMEOUT};
use crate::orchestration::events::{BuildEvent, BuildId, EventBus, EventKind};
use crate::orchestration::executor::{CodeGenerator, GenerationOutput, Sandbox, Verifier};
use crate::orchestration::queue::{
    Assignment, FailOutcome, QueueConfig, QueuedTask, WorkStealingQueue, WorkerStats,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Default idle back-off between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default period of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    /// Upper bound on how long an idle worker sleeps before looking again.
    pub poll_interval: Duration,
    /// How long a task waits for contended file claims.
    pub claim_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

/// Lifecycle of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed | OrchestratorState::Failed | OrchestratorState::Cancelled
        )
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Running => "running",
            OrchestratorState::Paused => "paused",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Failed => "failed",
            OrchestratorState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Build progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    pub current_phase: Option<String>,
    /// Linear estimate from the average time per finished task.
    pub eta_ms: Option<u64>,
}

/// Point-in-time view of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub build_id: BuildId,
    pub state: OrchestratorState,
    pub progress: Progress,
    pub counts: StatusCounts,
    pub errors: Vec<String>,
    pub workers: Vec<WorkerStats>,
    pub steal_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub id: TaskId,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub id: TaskId,
    pub reason: String,
}

/// Final outcome of [`Orchestrator::orchestrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub build_id: BuildId,
    pub status: OrchestratorState,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub failed: Vec<TaskFailure>,
    pub blocked: Vec<BlockedTask>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    pub duration_formatted: String,
    pub steal_count: u64,
    pub workers: Vec<WorkerStats>,
    /// Percentage of tasks completed.
    pub score: f64,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.status == OrchestratorState::Completed
    }
}

/// Human-readable duration: `42.0s`, `1.5m`, `2.0h`, `1.2d`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else if secs < 86_400.0 {
        format!("{:.1}h", secs / 3600.0)
    } else {
        format!("{:.1}d", secs / 86_400.0)
    }
}

/// Everything guarded by the global lock.
struct Shared {
    graph: DependencyGraph,
    queue: WorkStealingQueue,
    plan: ExecutionPlan,
    /// First phase not yet completed.
    next_phase: usize,
    errors: Vec<String>,
    started_at: Option<Instant>,
    /// Set once the workers have drained the queue; no more tasks are admitted.
    closed: bool,
}

impl Shared {
    fn record_success(
        &mut self,
        events: &EventBus,
        worker: WorkerId,
        id: &TaskId,
        output: GenerationOutput,
    ) {
        if let Err(e) = self.queue.complete_task(id, worker) {
            tracing::warn!(task_id = %id, worker = %worker, error = %e, "discarding late result");
            return;
        }

        if let Some(task) = self.graph.get_task_mut(id) {
            task.output = Some(TaskOutput {
                files_modified: output.files_modified.clone(),
                exports: output.exports,
            });
        }
        let change = match self.graph.complete_task(id) {
            Ok(change) => change,
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "graph rejected completion");
                self.errors.push(e.to_string());
                return;
            }
        };

        tracing::info!(task_id = %id, worker = %worker, "task completed");
        events.emit(EventKind::TaskCompleted {
            task_id: id.clone(),
            worker,
            files_modified: output.files_modified,
        });
        for ready in change.newly_ready {
            events.emit(EventKind::TaskReady { task_id: ready });
        }
        self.advance_phases(events);
    }

    fn record_failure(&mut self, events: &EventBus, worker: WorkerId, id: &TaskId, error: &str) {
        match self.queue.fail_task(id, worker, error) {
            Ok(outcome) => self.apply_failure(events, worker, id, error, outcome),
            Err(e) => {
                tracing::warn!(task_id = %id, worker = %worker, error = %e, "discarding late failure");
            }
        }
    }

    /// Mirror a queue failure outcome into the graph.
    fn apply_failure(
        &mut self,
        events: &EventBus,
        worker: WorkerId,
        id: &TaskId,
        error: &str,
        outcome: FailOutcome,
    ) {
        match outcome {
            FailOutcome::Requeued { attempt, .. } => {
                if let Err(e) = self.graph.retry_task(id, error) {
                    tracing::error!(task_id = %id, error = %e, "graph rejected retry");
                }
                events.emit(EventKind::TaskFailed {
                    task_id: id.clone(),
                    worker,
                    error: error.to_string(),
                    attempt,
                    will_retry: true,
                });
            }
            FailOutcome::Exhausted { attempts, withdrawn } => {
                tracing::error!(task_id = %id, attempts, error, "task failed permanently");
                self.errors.push(format!("{}: {}", id, error));

                let mut blocked = match self.graph.fail_task(id, error) {
                    Ok(change) => change.blocked,
                    Err(e) => {
                        tracing::error!(task_id = %id, error = %e, "graph rejected failure");
                        Vec::new()
                    }
                };
                self.queue.withdraw(&blocked);
                for extra in withdrawn {
                    if !blocked.contains(&extra) {
                        blocked.push(extra);
                    }
                }

                events.emit(EventKind::TaskFailed {
                    task_id: id.clone(),
                    worker,
                    error: error.to_string(),
                    attempt: attempts,
                    will_retry: false,
                });
                for task_id in blocked {
                    let reason = match self.graph.get_task(&task_id).map(|t| &t.status) {
                        Some(TaskStatus::Blocked { reason }) => reason.clone(),
                        _ => format!("dependency {} failed", id),
                    };
                    events.emit(EventKind::TaskBlocked { task_id, reason });
                }
                self.advance_phases(events);
            }
        }
    }

    /// Emit phase boundaries for every leading phase whose tasks are all finished.
    fn advance_phases(&mut self, events: &EventBus) {
        loop {
            let Some(phase) = self.plan.phases.get(self.next_phase) else {
                return;
            };
            let finished = phase.tasks.iter().all(|id| {
                self.graph
                    .get_task(id)
                    .map(|t| t.is_finished())
                    .unwrap_or(true)
            });
            if !finished {
                return;
            }

            tracing::info!(phase = %phase.name, "phase completed");
            events.emit(EventKind::PhaseCompleted {
                index: phase.index,
                name: phase.name.clone(),
            });
            self.next_phase += 1;
            if let Some(next) = self.plan.phases.get(self.next_phase) {
                tracing::info!(phase = %next.name, "phase started");
                events.emit(EventKind::PhaseStarted {
                    index: next.index,
                    name: next.name.clone(),
                });
            }
        }
    }

    /// Swap in a recomputed plan and point at its first unfinished phase.
    fn replan(&mut self, plan: ExecutionPlan, events: &EventBus) {
        let previous = self
            .plan
            .phases
            .get(self.next_phase)
            .map(|p| (p.index, p.name.clone()));
        self.plan = plan;
        self.next_phase = self
            .plan
            .phases
            .iter()
            .position(|phase| {
                phase.tasks.iter().any(|id| {
                    self.graph
                        .get_task(id)
                        .map(|t| !t.is_finished())
                        .unwrap_or(false)
                })
            })
            .unwrap_or(self.plan.phases.len());

        let Some(current) = self.plan.phases.get(self.next_phase) else {
            return;
        };
        if previous.as_ref() != Some(&(current.index, current.name.clone())) {
            tracing::info!(phase = %current.name, "phase started");
            events.emit(EventKind::PhaseStarted {
                index: current.index,
                name: current.name.clone(),
            });
        }
    }

    fn progress(&self) -> Progress {
        let counts = self.graph.status_counts();
        let total = counts.total();
        let finished = counts.completed + counts.failed + counts.blocked;
        let percent = if total == 0 {
            0.0
        } else {
            counts.completed as f64 * 100.0 / total as f64
        };
        let eta_ms = match self.started_at {
            Some(start) if finished > 0 && finished < total => {
                let per_task = start.elapsed().as_millis() as u64 / finished as u64;
                Some(per_task * (total - finished) as u64)
            }
            _ => None,
        };
        Progress {
            completed: counts.completed,
            total,
            percent,
            current_phase: self
                .plan
                .phases
                .get(self.next_phase)
                .map(|p| p.name.clone()),
            eta_ms,
        }
    }
}

enum Next {
    Run(Assignment, Task),
    Idle,
    Done,
}

/// Handles shared by every worker loop and the timeout sweeper.
#[derive(Clone)]
struct WorkerContext {
    config: OrchestratorConfig,
    shared: Arc<Mutex<Shared>>,
    events: EventBus,
    ready: Arc<Notify>,
    state: watch::Receiver<OrchestratorState>,
    cancel: CancellationToken,
    claims: FileClaims,
    generator: Arc<dyn CodeGenerator>,
    verifier: Arc<dyn Verifier>,
}

impl WorkerContext {
    async fn run_worker(mut self, worker: WorkerId) {
        tracing::debug!(worker = %worker, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let paused = *self.state.borrow_and_update() == OrchestratorState::Paused;
            if paused {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = self.state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.next_task(worker).await {
                Next::Run(assignment, task) => self.run_task(worker, assignment, task).await,
                Next::Idle => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.ready.notified() => {}
                        _ = self.state.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Next::Done => break,
            }
        }

        self.shared.lock().await.queue.deactivate(worker);
        self.ready.notify_waiters();
        tracing::debug!(worker = %worker, "worker stopped");
    }

    async fn next_task(&self, worker: WorkerId) -> Next {
        let mut shared = self.shared.lock().await;
        if shared.closed {
            return Next::Done;
        }
        if *self.state.borrow() != OrchestratorState::Running {
            return Next::Idle;
        }

        let Some(assignment) = shared.queue.acquire_task(worker) else {
            if shared.queue.has_pending_work() {
                return Next::Idle;
            }
            shared.closed = true;
            return Next::Done;
        };

        let id = assignment.task_id.clone();
        if let Err(e) = shared.graph.start_task(&id, worker) {
            tracing::error!(task_id = %id, error = %e, "graph rejected start");
            shared.record_failure(&self.events, worker, &id, &e.to_string());
            return Next::Idle;
        }
        let Some(task) = shared.graph.get_task(&id).cloned() else {
            shared.record_failure(&self.events, worker, &id, &Error::TaskNotFound(id.clone()).to_string());
            return Next::Idle;
        };

        tracing::info!(
            task_id = %id,
            worker = %worker,
            attempt = assignment.attempt,
            "task started"
        );
        self.events.emit(EventKind::TaskStarted {
            task_id: id,
            worker,
            attempt: assignment.attempt,
        });
        Next::Run(assignment, task)
    }

    async fn run_task(&self, worker: WorkerId, assignment: Assignment, task: Task) {
        let timeout = self.config.queue.task_timeout;
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(task_id = %task.id, "attempt abandoned on cancel");
                return;
            }
            result = tokio::time::timeout(timeout, self.execute(&task)) => {
                result.unwrap_or_else(|_| Err(Error::Timeout(timeout)))
            }
        };

        {
            let mut shared = self.shared.lock().await;
            match outcome {
                Ok(output) => shared.record_success(&self.events, worker, &assignment.task_id, output),
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        worker = %worker,
                        attempt = assignment.attempt,
                        error = %e,
                        "attempt failed"
                    );
                    // The sweeper reports its own timeouts after releasing the lock.
                    let still_held = shared.queue.lock_holder(&assignment.task_id) == Some(worker);
                    if matches!(e, Error::Timeout(_)) && still_held {
                        self.events.emit(EventKind::TaskTimeout {
                            task_id: assignment.task_id.clone(),
                            worker,
                        });
                    }
                    shared.record_failure(&self.events, worker, &assignment.task_id, &e.to_string())
                }
            }
        }
        self.ready.notify_waiters();
    }

    /// One attempt: claim, generate, verify. Claims drop on every return.
    async fn execute(&self, task: &Task) -> Result<GenerationOutput> {
        let guard = self
            .claims
            .claim_with_wait(&task.id, &task.claimed_paths(), self.config.claim_timeout)
            .await?;

        let output = self.generator.execute(task, guard.paths()).await?;
        if !output.success {
            return Err(Error::Generation(
                output
                    .error
                    .clone()
                    .unwrap_or_else(|| "generator reported failure".to_string()),
            ));
        }
        if !output.verification_passed {
            return Err(Error::Verification(
                output
                    .error
                    .clone()
                    .unwrap_or_else(|| "generator rejected its output".to_string()),
            ));
        }

        let report = self.verifier.verify(&output.files_modified).await?;
        if !report.passed {
            return Err(Error::Verification(report.summary()));
        }
        Ok(output)
    }

    async fn sweep_timeouts(self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let error = Error::Timeout(self.config.queue.task_timeout).to_string();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let reclaimed = {
                let mut shared = self.shared.lock().await;
                let timed_out = shared.queue.check_timeouts(Instant::now());
                let count = timed_out.len();
                for t in timed_out {
                    shared.apply_failure(&self.events, t.worker, &t.task_id, &error, t.outcome);
                }
                count
            };
            if reclaimed > 0 {
                self.ready.notify_waiters();
            }
        }
    }
}

/// Drives one build over a worker pool.
pub struct Orchestrator {
    config: OrchestratorConfig,
    shared: Arc<Mutex<Shared>>,
    events: EventBus,
    ready: Arc<Notify>,
    state_tx: watch::Sender<OrchestratorState>,
    cancel: CancellationToken,
    claims: FileClaims,
    generator: Arc<dyn CodeGenerator>,
    verifier: Arc<dyn Verifier>,
    sandbox: Arc<dyn Sandbox>,
}

impl Orchestrator {
    pub fn new(
        mut config: OrchestratorConfig,
        generator: Arc<dyn CodeGenerator>,
        verifier: Arc<dyn Verifier>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        config.queue.worker_count = config.queue.worker_count.max(1);
        let events = EventBus::new(BuildId::new());
        let queue = WorkStealingQueue::with_events(config.queue.clone(), events.clone());
        let (state_tx, _) = watch::channel(OrchestratorState::Initializing);

        Self {
            config,
            shared: Arc::new(Mutex::new(Shared {
                graph: DependencyGraph::new(),
                queue,
                plan: ExecutionPlan::default(),
                next_phase: 0,
                errors: Vec::new(),
                started_at: None,
                closed: false,
            })),
            events,
            ready: Arc::new(Notify::new()),
            state_tx,
            cancel: CancellationToken::new(),
            claims: FileClaims::new(),
            generator,
            verifier,
            sandbox,
        }
    }

    pub fn build_id(&self) -> BuildId {
        self.events.build_id()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state_tx.subscribe()
    }

    pub fn claims(&self) -> &FileClaims {
        &self.claims
    }

    /// Copy of the dependency graph as it stands now.
    pub async fn graph_snapshot(&self) -> DependencyGraph {
        self.shared.lock().await.graph.clone()
    }

    /// Admit tasks, before or during a build.
    ///
    /// Once the build is running the batch is validated against the existing
    /// graph first and rejected as a whole on a cycle, a dangling reference or
    /// a duplicate id. Before the build starts only duplicates are rejected;
    /// the full graph is validated by [`orchestrate`](Self::orchestrate).
    pub async fn add_tasks(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        let mut shared = self.shared.lock().await;
        if shared.closed || self.state().is_terminal() {
            return Err(Error::InvalidState(format!(
                "cannot add tasks to a {} build",
                self.state()
            )));
        }

        let max_attempts = self.config.queue.max_attempts;
        let mut candidate = shared.graph.clone();
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = Task::from_spec(spec, max_attempts);
            ids.push(task.id.clone());
            candidate.add_task(task)?;
        }

        let started = shared.started_at.is_some();
        let plan = if started {
            candidate.validate().into_result()?;
            Some(candidate.execution_plan()?)
        } else {
            None
        };
        shared.graph = candidate;
        if let Some(plan) = plan {
            shared.replan(plan, &self.events);
        }

        if started {
            for id in &ids {
                let Some(task) = shared.graph.get_task(id) else {
                    continue;
                };
                match &task.status {
                    TaskStatus::Blocked { reason } => {
                        self.events.emit(EventKind::TaskBlocked {
                            task_id: id.clone(),
                            reason: reason.clone(),
                        });
                    }
                    _ => {
                        let queued = QueuedTask::from_task(task);
                        shared.queue.submit(queued)?;
                    }
                }
            }
            self.ready.notify_waiters();
        }

        tracing::info!(count = ids.len(), running = started, "tasks added");
        Ok(ids)
    }

    /// Run the build to completion, failure or cancellation.
    ///
    /// # Errors
    /// Validation errors and sandbox failures abort before any task starts;
    /// the state becomes `failed`. Task failures never make this return `Err`,
    /// they are reported in the [`BuildResult`].
    pub async fn orchestrate(&self) -> Result<BuildResult> {
        let started = Instant::now();
        if self.cancel.is_cancelled() {
            return Ok(self.finish(started).await);
        }
        if self.state() != OrchestratorState::Initializing {
            return Err(Error::InvalidState(format!(
                "build is already {}",
                self.state()
            )));
        }

        if let Err(e) = self.sandbox.ensure_ready().await {
            self.abort(&e);
            return Err(e);
        }

        let task_count = {
            let mut shared = self.shared.lock().await;
            if let Err(e) = shared.graph.validate().into_result() {
                drop(shared);
                self.abort(&e);
                return Err(e);
            }
            let plan = match shared.graph.execution_plan() {
                Ok(plan) => plan,
                Err(e) => {
                    drop(shared);
                    self.abort(&e);
                    return Err(e);
                }
            };

            let queued: Vec<QueuedTask> = plan
                .phases
                .iter()
                .flat_map(|p| p.tasks.iter())
                .filter_map(|id| shared.graph.get_task(id))
                .filter(|t| !t.is_finished())
                .map(QueuedTask::from_task)
                .collect();
            for task in queued {
                shared.queue.submit(task)?;
            }

            if let Some(first) = plan.phases.first() {
                self.events.emit(EventKind::PhaseStarted {
                    index: first.index,
                    name: first.name.clone(),
                });
            }
            shared.plan = plan;
            shared.started_at = Some(started);
            shared.graph.task_count()
        };

        let began = self.state_tx.send_if_modified(|state| {
            if *state == OrchestratorState::Initializing {
                *state = OrchestratorState::Running;
                true
            } else {
                false
            }
        });
        if !began {
            return Ok(self.finish(started).await);
        }
        tracing::info!(
            build = %self.build_id().short(),
            tasks = task_count,
            workers = self.config.queue.worker_count,
            "build started"
        );

        let ctx = WorkerContext {
            config: self.config.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            ready: self.ready.clone(),
            state: self.state_tx.subscribe(),
            cancel: self.cancel.clone(),
            claims: self.claims.clone(),
            generator: self.generator.clone(),
            verifier: self.verifier.clone(),
        };

        let sweep_stop = self.cancel.child_token();
        let sweeper = tokio::spawn(ctx.clone().sweep_timeouts(sweep_stop.clone()));
        let handles: Vec<_> = (0..self.config.queue.worker_count)
            .map(|i| tokio::spawn(ctx.clone().run_worker(WorkerId(i))))
            .collect();

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task panicked");
                self.shared
                    .lock()
                    .await
                    .errors
                    .push(Error::TaskJoin(e.to_string()).to_string());
            }
        }
        sweep_stop.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "timeout sweeper panicked");
        }

        Ok(self.finish(started).await)
    }

    /// Stop handing out tasks. In-flight attempts run to completion.
    pub fn pause(&self) -> Result<()> {
        let paused = self.state_tx.send_if_modified(|state| {
            if *state == OrchestratorState::Running {
                *state = OrchestratorState::Paused;
                true
            } else {
                false
            }
        });
        if !paused {
            return Err(Error::InvalidState(format!("cannot pause a {} build", self.state())));
        }
        tracing::info!(build = %self.build_id().short(), "build paused");
        self.events.emit(EventKind::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let resumed = self.state_tx.send_if_modified(|state| {
            if *state == OrchestratorState::Paused {
                *state = OrchestratorState::Running;
                true
            } else {
                false
            }
        });
        if !resumed {
            return Err(Error::InvalidState(format!("cannot resume a {} build", self.state())));
        }
        tracing::info!(build = %self.build_id().short(), "build resumed");
        self.events.emit(EventKind::Resumed);
        self.ready.notify_waiters();
        Ok(())
    }

    /// Tear the build down. In-flight attempts are abandoned and their
    /// execution locks released. No effect on a finished build.
    pub fn cancel(&self) {
        let cancelled = self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = OrchestratorState::Cancelled;
                true
            }
        });
        if cancelled {
            self.cancel.cancel();
            tracing::info!(build = %self.build_id().short(), "build cancelled");
            self.events.emit(EventKind::Cancelled);
        }
    }

    pub async fn status(&self) -> BuildStatus {
        let shared = self.shared.lock().await;
        BuildStatus {
            build_id: self.build_id(),
            state: self.state(),
            progress: shared.progress(),
            counts: shared.graph.status_counts(),
            errors: shared.errors.clone(),
            workers: shared.queue.worker_stats(),
            steal_count: shared.queue.steal_count(),
        }
    }

    fn abort(&self, error: &Error) {
        tracing::error!(build = %self.build_id().short(), error = %error, "build aborted");
        self.state_tx.send_replace(OrchestratorState::Failed);
        self.events.emit(EventKind::Failed {
            errors: vec![error.to_string()],
        });
    }

    async fn finish(&self, started: Instant) -> BuildResult {
        let mut shared = self.shared.lock().await;
        shared.closed = true;

        let state = if self.cancel.is_cancelled() {
            let reason = Error::Cancelled.to_string();
            for id in shared.queue.release_all() {
                if let Err(e) = shared.graph.retry_task(&id, &reason) {
                    tracing::debug!(task_id = %id, error = %e, "could not reset task");
                }
            }
            self.claims.clear();
            OrchestratorState::Cancelled
        } else if shared.graph.is_complete() && !shared.graph.has_failed() {
            OrchestratorState::Completed
        } else {
            if !shared.graph.is_complete() {
                let counts = shared.graph.status_counts();
                let stranded = counts.pending + counts.ready + counts.in_progress;
                shared.errors.push(format!("{} tasks never ran", stranded));
            }
            OrchestratorState::Failed
        };

        let counts = shared.graph.status_counts();
        let total = counts.total();
        let score = if total == 0 {
            100.0
        } else {
            counts.completed as f64 * 100.0 / total as f64
        };
        let duration = started.elapsed();

        let result = BuildResult {
            build_id: self.build_id(),
            status: state,
            tasks_completed: counts.completed,
            tasks_failed: counts.failed,
            failed: shared
                .graph
                .failed_tasks()
                .into_iter()
                .map(|t| TaskFailure {
                    id: t.id.clone(),
                    error: match &t.status {
                        TaskStatus::Failed { error } => error.clone(),
                        _ => t.last_error.clone().unwrap_or_default(),
                    },
                    attempts: t.attempts,
                })
                .collect(),
            blocked: shared
                .graph
                .blocked_tasks()
                .into_iter()
                .map(|t| BlockedTask {
                    id: t.id.clone(),
                    reason: match &t.status {
                        TaskStatus::Blocked { reason } => reason.clone(),
                        _ => String::new(),
                    },
                })
                .collect(),
            errors: shared.errors.clone(),
            duration_ms: duration.as_millis() as u64,
            duration_formatted: format_duration(duration),
            steal_count: shared.queue.steal_count(),
            workers: shared.queue.worker_stats(),
            score,
        };
        drop(shared);

        match state {
            OrchestratorState::Completed => {
                self.state_tx.send_replace(state);
                self.events.emit(EventKind::Completed { score });
            }
            OrchestratorState::Failed => {
                self.state_tx.send_replace(state);
                self.events.emit(EventKind::Failed {
                    errors: result.errors.clone(),
                });
            }
            _ => {
                self.state_tx.send_replace(state);
            }
        }

        tracing::info!(
            build = %self.build_id().short(),
            status = %state,
            completed = result.tasks_completed,
            failed = result.tasks_failed,
            blocked = result.blocked.len(),
            steals = result.steal_count,
            duration = %result.duration_formatted,
            "build finished"
        );
        result
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("build_id", &self.build_id())
            .field("state", &self.state())
            .field("workers", &self.config.queue.worker_count)
            .finish()
    }
}
