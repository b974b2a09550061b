//! Work-stealing task queue.
//!
//! Every worker owns a deque of assigned-but-not-started tasks. A shared
//! overflow queue holds tasks that are waiting on dependencies, that were
//! requeued for another attempt, or that had no worker to go to. Workers
//! consume their own deque LIFO, fall back to the overflow queue FIFO, and
//! when their own deque runs low they steal the oldest ready task from the
//! busiest other worker.
//!
//! Readiness is judged only from each task's explicit dependency list and
//! the queue's own completed set, so the queue works with or without a
//! [`DependencyGraph`](crate::core::DependencyGraph) next to it.
//!
//! The queue holds no locks of its own; the owner serializes access.

use crate::core::task::{Task, TaskId, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::events::{EventBus, EventKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Default number of workers in the pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of tasks moved per steal.
pub const DEFAULT_STEAL_BATCH_SIZE: usize = 1;

/// Default deque length below which a worker tries to steal.
pub const DEFAULT_STEAL_THRESHOLD: usize = 2;

/// Default time a task may stay in progress.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Default attempts per task before it is exhausted.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default cap on how far steals and retries may raise a task's urgency.
pub const DEFAULT_MAX_PRIORITY_BOOST: u32 = 2;

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub steal_batch_size: usize,
    /// A worker whose deque is shorter than this steals; a victim must hold more.
    pub steal_threshold: usize,
    pub task_timeout: Duration,
    /// Attempts given to tasks that do not set their own.
    pub max_attempts: u32,
    pub boost_stolen_priority: bool,
    /// Most priority levels a task can gain over its submitted priority.
    pub max_priority_boost: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            steal_batch_size: DEFAULT_STEAL_BATCH_SIZE,
            steal_threshold: DEFAULT_STEAL_THRESHOLD,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            boost_stolen_priority: true,
            max_priority_boost: DEFAULT_MAX_PRIORITY_BOOST,
        }
    }
}

impl QueueConfig {
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }
}

/// Why a task sits in the overflow queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    DependenciesPending,
    Retry,
    Unassigned,
}

/// A task as the queue sees it.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub dependencies: Vec<TaskId>,
    /// Current priority; lower runs first.
    pub priority: u32,
    /// Priority at submission, the reference for the boost cap.
    pub base_priority: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub reason: Option<QueueReason>,
    pub last_error: Option<String>,
    pub enqueued_at: Instant,
}

impl QueuedTask {
    pub fn new(id: TaskId, dependencies: Vec<TaskId>, priority: u32, max_attempts: u32) -> Self {
        Self {
            id,
            dependencies,
            priority,
            base_priority: priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            assigned_worker: None,
            reason: None,
            last_error: None,
            enqueued_at: Instant::now(),
        }
    }

    pub fn from_task(task: &Task) -> Self {
        let mut queued = Self::new(
            task.id.clone(),
            task.dependencies().iter().cloned().collect(),
            task.priority,
            task.max_attempts,
        );
        queued.attempts = task.attempts;
        queued
    }

    /// Raise urgency one level, never past the cap or below zero.
    fn boost(&mut self, max_boost: u32) {
        let floor = self.base_priority.saturating_sub(max_boost);
        self.priority = self.priority.saturating_sub(1).max(floor);
    }
}

/// Per-worker scheduling state.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: WorkerId,
    deque: VecDeque<QueuedTask>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Tasks other workers stole from this one.
    pub stolen_from: u64,
    pub total_work_time: Duration,
    pub active: bool,
    pub last_activity: DateTime<Utc>,
}

impl WorkerState {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            deque: VecDeque::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            stolen_from: 0,
            total_work_time: Duration::ZERO,
            active: true,
            last_activity: Utc::now(),
        }
    }

    pub fn deque_len(&self) -> usize {
        self.deque.len()
    }

    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.deque.iter().map(|t| t.id.clone()).collect()
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Serializable snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub queued: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub stolen_from: u64,
    pub work_time_ms: u64,
    pub active: bool,
}

/// A task handed to a worker, now holding its execution lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker: WorkerId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub priority: u32,
    /// Victim worker when the task was acquired by stealing.
    pub stolen_from: Option<WorkerId>,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the overflow queue for another attempt.
    Requeued { attempt: u32, priority: u32 },
    /// No attempts left. `withdrawn` lists queued tasks that depended on it.
    Exhausted {
        attempts: u32,
        withdrawn: Vec<TaskId>,
    },
}

impl FailOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailOutcome::Exhausted { .. })
    }
}

/// A task reclaimed by the timeout sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub outcome: FailOutcome,
}

#[derive(Debug, Clone)]
struct InFlight {
    task: QueuedTask,
    worker: WorkerId,
    started_at: Instant,
}

/// Work-stealing scheduler over a fixed worker pool.
pub struct WorkStealingQueue {
    config: QueueConfig,
    workers: Vec<WorkerState>,
    /// Shared overflow queue, oldest first.
    global: VecDeque<QueuedTask>,
    /// Execution locks: task id to the worker running it.
    locks: HashMap<TaskId, InFlight>,
    completed: HashSet<TaskId>,
    exhausted: HashMap<TaskId, String>,
    withdrawn: HashSet<TaskId>,
    known: HashSet<TaskId>,
    steal_count: u64,
    events: Option<EventBus>,
}

impl WorkStealingQueue {
    pub fn new(config: QueueConfig) -> Self {
        let workers = (0..config.worker_count)
            .map(|i| WorkerState::new(WorkerId(i)))
            .collect();
        Self {
            config,
            workers,
            global: VecDeque::new(),
            locks: HashMap::new(),
            completed: HashSet::new(),
            exhausted: HashMap::new(),
            withdrawn: HashSet::new(),
            known: HashSet::new(),
            steal_count: 0,
            events: None,
        }
    }

    /// Create a queue that publishes steal and timeout events.
    pub fn with_events(config: QueueConfig, events: EventBus) -> Self {
        let mut queue = Self::new(config);
        queue.events = Some(events);
        queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn emit(&self, kind: EventKind) {
        if let Some(events) = &self.events {
            events.emit(kind);
        }
    }

    fn is_ready(&self, task: &QueuedTask) -> bool {
        task.dependencies.iter().all(|d| self.completed.contains(d))
    }

    fn least_loaded(&self) -> Option<usize> {
        self.workers
            .iter()
            .filter(|w| w.active)
            .min_by(|a, b| a.deque.len().cmp(&b.deque.len()).then(a.id.cmp(&b.id)))
            .map(|w| w.id.index())
    }

    // ========== Submission ==========

    /// Submit a task.
    ///
    /// Tasks with unmet dependencies wait in the overflow queue; ready tasks
    /// go to the least-loaded active worker.
    pub fn submit(&mut self, mut task: QueuedTask) -> Result<()> {
        if !self.known.insert(task.id.clone()) {
            return Err(Error::DuplicateTask(task.id));
        }

        if !self.is_ready(&task) {
            tracing::debug!(task_id = %task.id, "queued: dependencies pending");
            task.reason = Some(QueueReason::DependenciesPending);
            self.global.push_back(task);
            return Ok(());
        }

        match self.least_loaded() {
            Some(index) => {
                let worker = &mut self.workers[index];
                tracing::debug!(task_id = %task.id, worker = %worker.id, "assigned");
                task.assigned_worker = Some(worker.id);
                task.reason = None;
                worker.deque.push_back(task);
            }
            None => {
                task.reason = Some(QueueReason::Unassigned);
                self.global.push_back(task);
            }
        }
        Ok(())
    }

    /// Place a task directly on a worker's deque, ready or not.
    pub fn submit_to(&mut self, worker: WorkerId, mut task: QueuedTask) -> Result<()> {
        if worker.index() >= self.workers.len() {
            return Err(Error::Validation(format!("unknown worker {}", worker)));
        }
        if !self.known.insert(task.id.clone()) {
            return Err(Error::DuplicateTask(task.id));
        }
        task.assigned_worker = Some(worker);
        task.reason = None;
        self.workers[worker.index()].deque.push_back(task);
        Ok(())
    }

    // ========== Acquisition ==========

    /// Hand the next task to `worker` and take its execution lock.
    ///
    /// Tries, in order: the worker's own deque, the overflow queue, then
    /// stealing when the worker's own deque is below the steal threshold.
    /// Within a source the most urgent ready task (lowest priority number)
    /// wins; ties go to the newest entry in the own deque and the oldest in
    /// the overflow queue.
    pub fn acquire_task(&mut self, worker: WorkerId) -> Option<Assignment> {
        let index = worker.index();
        if !self.workers.get(index).map(|w| w.active).unwrap_or(false) {
            return None;
        }

        let own = {
            let deque = &self.workers[index].deque;
            deque
                .iter()
                .enumerate()
                .filter(|(_, t)| self.is_ready(t))
                .min_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
                .map(|(pos, _)| pos)
        };
        if let Some(pos) = own {
            let task = self.workers[index].deque.remove(pos)?;
            return Some(self.lock(task, worker, None));
        }

        let overflow = self
            .global
            .iter()
            .enumerate()
            .filter(|(_, t)| self.is_ready(t))
            .min_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ia.cmp(ib)))
            .map(|(pos, _)| pos);
        if let Some(pos) = overflow {
            let task = self.global.remove(pos)?;
            return Some(self.lock(task, worker, None));
        }

        if self.workers[index].deque.len() < self.config.steal_threshold {
            if let Some((task, victim)) = self.steal(worker) {
                return Some(self.lock(task, worker, Some(victim)));
            }
        }

        None
    }

    fn lock(&mut self, mut task: QueuedTask, worker: WorkerId, stolen_from: Option<WorkerId>) -> Assignment {
        task.attempts += 1;
        task.assigned_worker = Some(worker);
        task.reason = None;

        let assignment = Assignment {
            task_id: task.id.clone(),
            worker,
            attempt: task.attempts,
            priority: task.priority,
            stolen_from,
        };
        tracing::debug!(
            task_id = %task.id,
            worker = %worker,
            attempt = task.attempts,
            stolen = stolen_from.is_some(),
            "acquired"
        );

        self.workers[worker.index()].touch();
        self.locks.insert(
            task.id.clone(),
            InFlight {
                task,
                worker,
                started_at: Instant::now(),
            },
        );
        assignment
    }

    /// Take the oldest ready tasks from the busiest other worker.
    fn steal(&mut self, thief: WorkerId) -> Option<(QueuedTask, WorkerId)> {
        let threshold = self.config.steal_threshold;
        let victim = self
            .workers
            .iter()
            .filter(|w| w.id != thief && w.active && w.deque.len() > threshold)
            .max_by(|a, b| a.deque.len().cmp(&b.deque.len()).then(b.id.cmp(&a.id)))
            .map(|w| w.id)?;

        let batch = self.config.steal_batch_size.max(1);
        let mut taken = Vec::new();
        let mut pos = 0;
        while taken.len() < batch && pos < self.workers[victim.index()].deque.len() {
            if self.is_ready(&self.workers[victim.index()].deque[pos]) {
                if let Some(task) = self.workers[victim.index()].deque.remove(pos) {
                    taken.push(task);
                }
            } else {
                pos += 1;
            }
        }
        if taken.is_empty() {
            return None;
        }

        let boost = self.config.boost_stolen_priority;
        let max_boost = self.config.max_priority_boost;
        for task in taken.iter_mut() {
            if boost {
                task.boost(max_boost);
            }
            task.assigned_worker = Some(thief);
            self.steal_count += 1;
            self.workers[victim.index()].stolen_from += 1;
            tracing::debug!(task_id = %task.id, from = %victim, to = %thief, "stolen");
            self.emit(EventKind::TaskStolen {
                task_id: task.id.clone(),
                from: victim,
                to: thief,
            });
        }

        let first = taken.remove(0);
        self.workers[thief.index()].deque.extend(taken);
        Some((first, victim))
    }

    // ========== Completion ==========

    fn release(&mut self, task_id: &TaskId, worker: WorkerId) -> Result<InFlight> {
        match self.locks.get(task_id) {
            Some(flight) if flight.worker == worker => {}
            _ => {
                return Err(Error::LockNotHeld {
                    task: task_id.clone(),
                    worker,
                })
            }
        }
        let flight = self
            .locks
            .remove(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        if let Some(state) = self.workers.get_mut(worker.index()) {
            state.total_work_time += flight.started_at.elapsed();
            state.touch();
        }
        Ok(flight)
    }

    /// Record success, release the lock and route newly ready tasks.
    ///
    /// Returns the ids moved out of the overflow queue.
    pub fn complete_task(&mut self, task_id: &TaskId, worker: WorkerId) -> Result<Vec<TaskId>> {
        self.release(task_id, worker)?;
        self.workers[worker.index()].tasks_completed += 1;
        self.completed.insert(task_id.clone());
        Ok(self.promote_ready())
    }

    /// Record a failed attempt and either requeue or exhaust the task.
    pub fn fail_task(&mut self, task_id: &TaskId, worker: WorkerId, error: &str) -> Result<FailOutcome> {
        let flight = self.release(task_id, worker)?;
        self.workers[worker.index()].tasks_failed += 1;
        Ok(self.requeue_or_exhaust(flight.task, error))
    }

    fn requeue_or_exhaust(&mut self, mut task: QueuedTask, error: &str) -> FailOutcome {
        task.last_error = Some(error.to_string());
        if task.attempts < task.max_attempts {
            task.boost(self.config.max_priority_boost);
            task.assigned_worker = None;
            task.reason = Some(QueueReason::Retry);
            let outcome = FailOutcome::Requeued {
                attempt: task.attempts,
                priority: task.priority,
            };
            tracing::info!(task_id = %task.id, attempt = task.attempts, error, "requeued for retry");
            self.global.push_back(task);
            outcome
        } else {
            tracing::warn!(task_id = %task.id, attempts = task.attempts, error, "task exhausted");
            let attempts = task.attempts;
            self.exhausted.insert(task.id.clone(), error.to_string());
            let withdrawn = self.withdraw_dependents_of(&task.id);
            FailOutcome::Exhausted { attempts, withdrawn }
        }
    }

    /// Move overflow tasks whose dependencies just completed to workers.
    fn promote_ready(&mut self) -> Vec<TaskId> {
        let mut promoted = Vec::new();
        let mut waiting = VecDeque::new();
        while let Some(task) = self.global.pop_front() {
            if task.reason == Some(QueueReason::DependenciesPending) && self.is_ready(&task) {
                promoted.push(task);
            } else {
                waiting.push_back(task);
            }
        }
        self.global = waiting;

        let mut ids = Vec::with_capacity(promoted.len());
        for mut task in promoted {
            ids.push(task.id.clone());
            match self.least_loaded() {
                Some(index) => {
                    task.assigned_worker = Some(self.workers[index].id);
                    task.reason = None;
                    self.workers[index].deque.push_back(task);
                }
                None => {
                    task.reason = Some(QueueReason::Unassigned);
                    self.global.push_back(task);
                }
            }
        }
        ids
    }

    /// Remove queued tasks that can never run because `root` is gone.
    fn withdraw_dependents_of(&mut self, root: &TaskId) -> Vec<TaskId> {
        let mut dead: HashSet<TaskId> = HashSet::from([root.clone()]);
        let mut withdrawn = Vec::new();
        loop {
            let doomed: Vec<TaskId> = self
                .queued_tasks()
                .filter(|t| t.dependencies.iter().any(|d| dead.contains(d)))
                .map(|t| t.id.clone())
                .collect();
            if doomed.is_empty() {
                break;
            }
            self.remove_queued(&doomed);
            for id in doomed {
                dead.insert(id.clone());
                self.withdrawn.insert(id.clone());
                withdrawn.push(id);
            }
        }
        withdrawn
    }

    /// Drop tasks that will never run (e.g. blocked by a failed ancestor).
    ///
    /// Returns how many queued entries were removed. In-progress tasks are
    /// left alone.
    pub fn withdraw(&mut self, ids: &[TaskId]) -> usize {
        let removed = self.remove_queued(ids);
        self.withdrawn.extend(ids.iter().cloned());
        removed
    }

    fn remove_queued(&mut self, ids: &[TaskId]) -> usize {
        let set: HashSet<&TaskId> = ids.iter().collect();
        let before = self.queued_count();
        self.global.retain(|t| !set.contains(&t.id));
        for worker in self.workers.iter_mut() {
            worker.deque.retain(|t| !set.contains(&t.id));
        }
        before - self.queued_count()
    }

    fn queued_tasks(&self) -> impl Iterator<Item = &QueuedTask> {
        self.global
            .iter()
            .chain(self.workers.iter().flat_map(|w| w.deque.iter()))
    }

    // ========== Timeouts ==========

    /// Reclaim every in-progress task older than the configured timeout.
    ///
    /// Each reclaimed task counts as a failed attempt.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<TimedOut> {
        let timeout = self.config.task_timeout;
        let mut expired: Vec<(TaskId, WorkerId)> = self
            .locks
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.started_at) >= timeout)
            .map(|(id, f)| (id.clone(), f.worker))
            .collect();
        expired.sort();

        let mut timed_out = Vec::new();
        for (task_id, worker) in expired {
            let Ok(flight) = self.release(&task_id, worker) else {
                continue;
            };
            self.workers[worker.index()].tasks_failed += 1;
            tracing::warn!(task_id = %task_id, worker = %worker, "task timed out");
            self.emit(EventKind::TaskTimeout {
                task_id: task_id.clone(),
                worker,
            });
            let outcome = self.requeue_or_exhaust(flight.task, &Error::Timeout(timeout).to_string());
            timed_out.push(TimedOut {
                task_id,
                worker,
                outcome,
            });
        }
        timed_out
    }

    // ========== Lifecycle ==========

    /// Mark a worker inactive; anything left in its deque goes to the overflow queue.
    pub fn deactivate(&mut self, worker: WorkerId) {
        let Some(state) = self.workers.get_mut(worker.index()) else {
            return;
        };
        state.active = false;
        let leftovers: Vec<QueuedTask> = state.deque.drain(..).collect();
        for mut task in leftovers {
            task.assigned_worker = None;
            task.reason = Some(QueueReason::Unassigned);
            self.global.push_back(task);
        }
    }

    /// Drop every execution lock, returning the ids that were in flight.
    pub fn release_all(&mut self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.locks.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    // ========== Queries ==========

    /// Anything queued anywhere or still running.
    pub fn has_pending_work(&self) -> bool {
        !self.global.is_empty()
            || !self.locks.is_empty()
            || self.workers.iter().any(|w| !w.deque.is_empty())
    }

    pub fn lock_holder(&self, task_id: &TaskId) -> Option<WorkerId> {
        self.locks.get(task_id).map(|f| f.worker)
    }

    pub fn in_progress_count(&self) -> usize {
        self.locks.len()
    }

    pub fn queued_count(&self) -> usize {
        self.global.len() + self.workers.iter().map(|w| w.deque.len()).sum::<usize>()
    }

    pub fn global_len(&self) -> usize {
        self.global.len()
    }

    pub fn steal_count(&self) -> u64 {
        self.steal_count
    }

    pub fn is_completed(&self, task_id: &TaskId) -> bool {
        self.completed.contains(task_id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn exhausted(&self) -> &HashMap<TaskId, String> {
        &self.exhausted
    }

    pub fn withdrawn(&self) -> &HashSet<TaskId> {
        &self.withdrawn
    }

    pub fn worker(&self, worker: WorkerId) -> Option<&WorkerState> {
        self.workers.get(worker.index())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|w| WorkerStats {
                id: w.id,
                queued: w.deque.len(),
                tasks_completed: w.tasks_completed,
                tasks_failed: w.tasks_failed,
                stolen_from: w.stolen_from,
                work_time_ms: w.total_work_time.as_millis() as u64,
                active: w.active,
            })
            .collect()
    }
}

impl std::fmt::Debug for WorkStealingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingQueue")
            .field("workers", &self.workers.len())
            .field("global", &self.global.len())
            .field("in_progress", &self.locks.len())
            .field("steals", &self.steal_count)
            .finish()
    }
}
