//! Execution phases and critical path.
//!
//! A phase is the set of tasks whose dependencies are all contained in
//! earlier phases. Phases are peeled greedily from the graph, so the first
//! phase holds every task without dependencies, the second everything that
//! only needs the first, and so on.

use crate::core::dag::DependencyGraph;
use crate::core::task::{TaskId, TaskType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A batch of tasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    /// Zero-based position in the plan.
    pub index: usize,
    pub name: String,
    /// Tasks ordered by priority, then id.
    pub tasks: Vec<TaskId>,
    /// Longest single-task estimate in the phase.
    pub estimated_duration_ms: u64,
}

/// Phased plan plus the longest dependency chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<ExecutionPhase>,
    /// Root-first chain with the greatest cumulative estimated duration.
    pub critical_path: Vec<TaskId>,
    pub critical_path_duration_ms: u64,
    /// Sum of phase estimates, the build time with unlimited workers.
    pub total_estimated_duration_ms: u64,
}

impl ExecutionPlan {
    /// Build the plan for every task currently in `graph`.
    ///
    /// # Errors
    /// Fails with [`Error::CycleDetected`] or [`Error::DanglingDependency`]
    /// when some tasks can never be scheduled.
    pub fn generate(graph: &DependencyGraph) -> Result<Self> {
        let mut scheduled: HashSet<TaskId> = HashSet::new();
        let mut remaining: Vec<TaskId> = graph.all_tasks().iter().map(|t| t.id.clone()).collect();
        let mut phases = Vec::new();

        while !remaining.is_empty() {
            let (batch, rest): (Vec<TaskId>, Vec<TaskId>) =
                remaining.into_iter().partition(|id| {
                    graph
                        .get_task(id)
                        .map(|t| t.dependencies().iter().all(|d| scheduled.contains(d)))
                        .unwrap_or(false)
                });

            if batch.is_empty() {
                let mut probe = graph.clone();
                probe.validate().into_result()?;
                return Err(Error::Validation(format!(
                    "{} tasks can never be scheduled",
                    rest.len()
                )));
            }

            let mut batch = batch;
            batch.sort_by(|a, b| {
                let pa = graph.get_task(a).map(|t| t.priority).unwrap_or(u32::MAX);
                let pb = graph.get_task(b).map(|t| t.priority).unwrap_or(u32::MAX);
                pa.cmp(&pb).then_with(|| a.cmp(b))
            });

            let index = phases.len();
            let estimated_duration_ms = batch
                .iter()
                .filter_map(|id| graph.get_task(id))
                .map(|t| t.estimated_duration_ms)
                .max()
                .unwrap_or(0);
            let name = phase_name(index, graph, &batch);

            scheduled.extend(batch.iter().cloned());
            phases.push(ExecutionPhase {
                index,
                name,
                tasks: batch,
                estimated_duration_ms,
            });
            remaining = rest;
        }

        let (critical_path, critical_path_duration_ms) = critical_path(graph);
        let total_estimated_duration_ms = phases.iter().map(|p| p.estimated_duration_ms).sum();

        Ok(Self {
            phases,
            critical_path,
            critical_path_duration_ms,
            total_estimated_duration_ms,
        })
    }

    /// Index of the phase containing `id`.
    pub fn phase_of(&self, id: &TaskId) -> Option<usize> {
        self.phases.iter().position(|p| p.tasks.contains(id))
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }
}

/// Names a phase after its most common task type.
fn phase_name(index: usize, graph: &DependencyGraph, tasks: &[TaskId]) -> String {
    let mut counts: HashMap<TaskType, usize> = HashMap::new();
    for task in tasks.iter().filter_map(|id| graph.get_task(id)) {
        *counts.entry(task.task_type).or_default() += 1;
    }
    let dominant = counts
        .into_iter()
        .max_by(|a, b| {
            a.1.cmp(&b.1)
                .then_with(|| b.0.default_priority().cmp(&a.0.default_priority()))
        })
        .map(|(t, _)| t.to_string())
        .unwrap_or_else(|| "empty".to_string());
    format!("phase {} ({})", index + 1, dominant)
}

/// Longest chain by cumulative estimated duration, via memoized DFS.
fn critical_path(graph: &DependencyGraph) -> (Vec<TaskId>, u64) {
    let mut memo: HashMap<TaskId, (u64, Option<TaskId>)> = HashMap::new();

    let mut ids: Vec<TaskId> = graph.all_tasks().iter().map(|t| t.id.clone()).collect();
    ids.sort();

    let mut best: Option<(u64, TaskId)> = None;
    for id in &ids {
        let (total, _) = longest_from(graph, id, &mut memo, &mut HashSet::new());
        let better = match &best {
            Some((b, _)) => total > *b,
            None => true,
        };
        if better {
            best = Some((total, id.clone()));
        }
    }

    let Some((total, end)) = best else {
        return (Vec::new(), 0);
    };

    let mut path = vec![end.clone()];
    let mut cursor = end;
    while let Some((_, Some(prev))) = memo.get(&cursor) {
        path.push(prev.clone());
        cursor = prev.clone();
    }
    path.reverse();
    (path, total)
}

/// Cumulative duration of the heaviest chain ending at `id`.
fn longest_from(
    graph: &DependencyGraph,
    id: &TaskId,
    memo: &mut HashMap<TaskId, (u64, Option<TaskId>)>,
    visiting: &mut HashSet<TaskId>,
) -> (u64, Option<TaskId>) {
    if let Some(hit) = memo.get(id) {
        return hit.clone();
    }
    let Some(task) = graph.get_task(id) else {
        return (0, None);
    };
    // Cycles are rejected before planning; guard anyway so this terminates.
    if !visiting.insert(id.clone()) {
        return (0, None);
    }

    let mut best: (u64, Option<TaskId>) = (0, None);
    for dep in task.dependencies() {
        if !graph.contains_task(dep) {
            continue;
        }
        let (total, _) = longest_from(graph, dep, memo, visiting);
        if total > best.0 || best.1.is_none() {
            best = (total.max(best.0), Some(dep.clone()));
        }
    }
    visiting.remove(id);

    let result = (best.0 + task.estimated_duration_ms, best.1);
    memo.insert(id.clone(), result.clone());
    result
}
