//! Dependency graph for build tasks.
//!
//! `DependencyGraph` stores tasks as petgraph nodes with an edge from each
//! dependency to the task that declared it. Tasks may reference
//! dependencies that have not been added yet; those references stay
//! dangling until the missing task arrives and are reported by
//! [`DependencyGraph::validate`].
//!
//! The graph is pure bookkeeping. It holds no locks and executes nothing;
//! callers serialize access.

use crate::core::plan::ExecutionPlan;
use crate::core::task::{Task, TaskId, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// A single problem found by [`DependencyGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationIssue {
    /// A task depends on an id that is not in the graph.
    DanglingReference { task: TaskId, dependency: TaskId },
    /// A dependency cycle; the first id is repeated at the end.
    Cycle { path: Vec<TaskId> },
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationIssue::DanglingReference { task, dependency } => {
                write!(f, "task {} depends on unknown task {}", task, dependency)
            }
            ValidationIssue::Cycle { path } => {
                let ids: Vec<&str> = path.iter().map(|id| id.as_str()).collect();
                write!(f, "cycle: {}", ids.join(" -> "))
            }
        }
    }
}

/// Outcome of graph validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// The first detected cycle, if any.
    pub fn cycle(&self) -> Option<&[TaskId]> {
        self.issues.iter().find_map(|issue| match issue {
            ValidationIssue::Cycle { path } => Some(path.as_slice()),
            _ => None,
        })
    }

    /// Convert into an error, cycles taking precedence over dangling references.
    pub fn into_result(self) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        if let Some(path) = self.cycle() {
            return Err(Error::CycleDetected {
                path: path.to_vec(),
            });
        }
        match self.issues.into_iter().next() {
            Some(ValidationIssue::DanglingReference { task, dependency }) => {
                Err(Error::DanglingDependency { task, dependency })
            }
            _ => Err(Error::Validation("invalid task graph".to_string())),
        }
    }
}

/// Side effects of a status transition on other tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusChange {
    /// Dependents that moved from pending to ready.
    pub newly_ready: Vec<TaskId>,
    /// Transitive dependents that became blocked.
    pub blocked: Vec<TaskId>,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.in_progress + self.completed + self.failed + self.blocked
    }
}

/// The task dependency graph.
#[derive(Clone)]
pub struct DependencyGraph {
    /// Edges run from a dependency to its dependent.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Reverse edges by id, including dependents of tasks not yet added.
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    /// Cycle found by the last validation.
    cycle: Option<Vec<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            dependents: HashMap::new(),
            cycle: None,
        }
    }

    /// Add a task to the graph.
    ///
    /// The task starts `ready` when every dependency is present and
    /// completed, `blocked` when a dependency already failed, and
    /// `pending` otherwise.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateTask`] if the id is already registered.
    pub fn add_task(&mut self, mut task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }

        let mut satisfied = true;
        let mut failed_dependency = None;
        for dep in task.dependencies() {
            match self.get_task(dep).map(|t| &t.status) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed { .. }) | Some(TaskStatus::Blocked { .. }) => {
                    satisfied = false;
                    failed_dependency.get_or_insert_with(|| dep.clone());
                }
                _ => satisfied = false,
            }
        }
        if let Some(dep) = failed_dependency {
            task.block(&format!("dependency {} failed", dep));
        } else if satisfied {
            task.mark_ready();
        } else {
            task.status = TaskStatus::Pending;
        }

        let id = task.id.clone();
        let deps: Vec<TaskId> = task.dependencies().iter().cloned().collect();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);

        for dep in deps {
            if let Some(&dep_index) = self.task_index.get(&dep) {
                self.graph.add_edge(dep_index, index, ());
            }
            self.dependents.entry(dep).or_default().insert(id.clone());
        }

        // Connect tasks that were waiting on this id before it existed.
        if let Some(waiting) = self.dependents.get(&id) {
            for dependent in waiting {
                if let Some(&dependent_index) = self.task_index.get(dependent) {
                    if self.graph.find_edge(index, dependent_index).is_none() {
                        self.graph.add_edge(index, dependent_index, ());
                    }
                }
            }
        }

        self.cycle = None;
        Ok(index)
    }

    /// Add several tasks, stopping at the first duplicate.
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<()> {
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    /// Check for dangling references and dependency cycles.
    ///
    /// Cycle detection is a depth-first search with an explicit recursion
    /// stack; the reported path starts and ends on the same task.
    pub fn validate(&mut self) -> ValidationReport {
        let mut issues = Vec::new();

        for id in self.sorted_ids() {
            if let Some(task) = self.get_task(&id) {
                for dep in task.dependencies() {
                    if !self.task_index.contains_key(dep) {
                        issues.push(ValidationIssue::DanglingReference {
                            task: id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        self.cycle = self.find_cycle();
        if let Some(path) = &self.cycle {
            issues.push(ValidationIssue::Cycle { path: path.clone() });
        }

        ValidationReport {
            valid: issues.is_empty(),
            issues,
        }
    }

    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut stack: Vec<TaskId> = Vec::new();
        let mut on_stack: HashSet<TaskId> = HashSet::new();

        for id in self.sorted_ids() {
            if !visited.contains(&id) {
                if let Some(path) = self.dfs_cycle(&id, &mut visited, &mut stack, &mut on_stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        id: &TaskId,
        visited: &mut HashSet<TaskId>,
        stack: &mut Vec<TaskId>,
        on_stack: &mut HashSet<TaskId>,
    ) -> Option<Vec<TaskId>> {
        visited.insert(id.clone());
        stack.push(id.clone());
        on_stack.insert(id.clone());

        if let Some(task) = self.get_task(id) {
            for dep in task.dependencies() {
                if !self.task_index.contains_key(dep) {
                    continue;
                }
                if on_stack.contains(dep) {
                    let start = stack.iter().position(|s| s == dep).unwrap_or(0);
                    let mut path = stack[start..].to_vec();
                    path.push(dep.clone());
                    return Some(path);
                }
                if !visited.contains(dep) {
                    if let Some(path) = self.dfs_cycle(dep, visited, stack, on_stack) {
                        return Some(path);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(id);
        None
    }

    /// Apply a status transition and propagate its effects.
    ///
    /// Completing a task promotes dependents whose dependencies are now all
    /// completed. Failing a task blocks every transitive dependent that is
    /// not already terminal.
    ///
    /// `Blocked` cannot be set directly; it only arises from propagation.
    pub fn update_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<StatusChange> {
        self.check_transition(id, &status)?;

        let mut change = StatusChange::default();
        let task = self
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;

        match status {
            TaskStatus::Completed => {
                task.complete();
                change.newly_ready = self.promote_dependents(id);
            }
            TaskStatus::Failed { error } => {
                task.fail(&error);
                change.blocked = self.block_dependents(id);
            }
            TaskStatus::InProgress => task.begin_attempt(),
            TaskStatus::Ready => {
                let error = task.last_error.clone().unwrap_or_default();
                task.retry(&error);
            }
            other => task.status = other,
        }

        Ok(change)
    }

    fn check_transition(&self, id: &TaskId, status: &TaskStatus) -> Result<()> {
        let current = &self
            .get_task(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?
            .status;

        let allowed = match (current, status) {
            (TaskStatus::Pending, TaskStatus::Ready) => self.dependencies_completed(id),
            (TaskStatus::Ready, TaskStatus::InProgress) => true,
            (TaskStatus::Ready, TaskStatus::Failed { .. }) => true,
            (TaskStatus::InProgress, TaskStatus::InProgress) => true,
            (TaskStatus::InProgress, TaskStatus::Ready) => true,
            (TaskStatus::InProgress, TaskStatus::Completed) => true,
            (TaskStatus::InProgress, TaskStatus::Failed { .. }) => true,
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: current.name().to_string(),
                to: status.name().to_string(),
            });
        }
        Ok(())
    }

    /// Mark a ready task as running on `worker`.
    pub fn start_task(&mut self, id: &TaskId, worker: WorkerId) -> Result<()> {
        self.check_transition(id, &TaskStatus::InProgress)?;
        let task = self
            .get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        task.start(worker);
        Ok(())
    }

    /// Return an in-progress task to `ready` after a failed attempt.
    pub fn retry_task(&mut self, id: &TaskId, error: &str) -> Result<()> {
        if let Some(task) = self.get_task_mut(id) {
            task.last_error = Some(error.to_string());
        }
        self.update_status(id, TaskStatus::Ready)?;
        Ok(())
    }

    /// Mark a task permanently failed and block everything downstream.
    pub fn fail_task(&mut self, id: &TaskId, error: &str) -> Result<StatusChange> {
        self.update_status(
            id,
            TaskStatus::Failed {
                error: error.to_string(),
            },
        )
    }

    pub fn complete_task(&mut self, id: &TaskId) -> Result<StatusChange> {
        self.update_status(id, TaskStatus::Completed)
    }

    fn dependencies_completed(&self, id: &TaskId) -> bool {
        self.get_task(id)
            .map(|task| {
                task.dependencies().iter().all(|dep| {
                    self.get_task(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn promote_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = self
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for dependent in candidates {
            let pending = self
                .get_task(&dependent)
                .map(|t| t.status == TaskStatus::Pending)
                .unwrap_or(false);
            if pending && self.dependencies_completed(&dependent) {
                if let Some(task) = self.get_task_mut(&dependent) {
                    task.mark_ready();
                    promoted.push(dependent);
                }
            }
        }
        promoted
    }

    fn block_dependents(&mut self, failed: &TaskId) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<(TaskId, TaskId)> = VecDeque::new();

        if let Some(direct) = self.dependents.get(failed) {
            for dependent in direct {
                queue.push_back((dependent.clone(), failed.clone()));
            }
        }

        while let Some((id, parent)) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(task) = self.get_task_mut(&id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let reason = if &parent == failed {
                format!("dependency {} failed", failed)
            } else {
                format!("ancestor {} failed (via {})", failed, parent)
            };
            task.block(&reason);
            blocked.push(id.clone());

            if let Some(next) = self.dependents.get(&id) {
                for dependent in next {
                    queue.push_back((dependent.clone(), id.clone()));
                }
            }
        }
        blocked
    }

    /// Tasks in dependency order.
    ///
    /// # Errors
    /// Returns [`Error::CycleDetected`] if the last validation found a cycle
    /// or if the graph is cyclic.
    pub fn execution_order(&self) -> Result<Vec<&Task>> {
        if let Some(path) = &self.cycle {
            return Err(Error::CycleDetected { path: path.clone() });
        }

        let sorted = toposort(&self.graph, None).map_err(|_| Error::CycleDetected {
            path: self.find_cycle().unwrap_or_default(),
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Compute phases and the critical path.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        ExecutionPlan::generate(self)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub(crate) fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        if let Some(&index) = self.task_index.get(id) {
            self.graph.node_weight_mut(index)
        } else {
            None
        }
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks that declared `id` as a dependency.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.dependents
            .get(id)
            .map(|set| set.iter().filter_map(|d| self.get_task(d)).collect())
            .unwrap_or_default()
    }

    /// Present tasks that `id` depends on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.get_task(id)
            .map(|task| {
                task.dependencies()
                    .iter()
                    .filter_map(|d| self.get_task(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    fn sorted_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.task_index.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn tasks_where(&self, pred: impl Fn(&TaskStatus) -> bool) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|t| pred(&t.status))
            .collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| *s == TaskStatus::Ready)
    }

    pub fn pending_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| *s == TaskStatus::Pending)
    }

    pub fn in_progress_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| *s == TaskStatus::InProgress)
    }

    pub fn completed_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| *s == TaskStatus::Completed)
    }

    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| matches!(s, TaskStatus::Failed { .. }))
    }

    pub fn blocked_tasks(&self) -> Vec<&Task> {
        self.tasks_where(|s| matches!(s, TaskStatus::Blocked { .. }))
    }

    /// Every task is in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.graph.node_weights().all(|t| t.status.is_terminal())
    }

    /// At least one task failed permanently.
    pub fn has_failed(&self) -> bool {
        self.graph
            .node_weights()
            .any(|t| matches!(t.status, TaskStatus::Failed { .. }))
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.graph.node_weights() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Blocked { .. } => counts.blocked += 1,
            }
        }
        counts
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
