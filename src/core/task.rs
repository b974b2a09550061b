//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of file-level work handed to workers. Each
//! task tracks its status, dependencies, scheduling metadata and the
//! files it touches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Identifier for a task, supplied by the planner and stable for the build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a worker in the fixed-size pool.
///
/// Workers are numbered from zero in the order the pool creates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Closed set of task classifications.
///
/// The type only drives defaults (priority, duration) and which paths a
/// task claims before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scaffold,
    Config,
    Types,
    Util,
    Api,
    #[default]
    Component,
    Page,
    Route,
    Style,
    Test,
    Integration,
}

impl TaskType {
    /// Default priority (lower runs first).
    pub fn default_priority(&self) -> u32 {
        match self {
            TaskType::Scaffold => 0,
            TaskType::Config => 1,
            TaskType::Types => 2,
            TaskType::Util => 3,
            TaskType::Api => 4,
            TaskType::Component => 5,
            TaskType::Page | TaskType::Route => 6,
            TaskType::Style => 7,
            TaskType::Test => 8,
            TaskType::Integration => 9,
        }
    }

    /// Default duration estimate in milliseconds.
    pub fn default_duration_ms(&self) -> u64 {
        match self {
            TaskType::Scaffold => 60_000,
            TaskType::Config => 15_000,
            TaskType::Types => 20_000,
            TaskType::Util => 25_000,
            TaskType::Api => 45_000,
            TaskType::Component => 40_000,
            TaskType::Page | TaskType::Route => 35_000,
            TaskType::Style => 20_000,
            TaskType::Test => 30_000,
            TaskType::Integration => 50_000,
        }
    }

    /// Whether the task owns a whole directory rather than a single file.
    pub fn claims_directory(&self) -> bool {
        matches!(self, TaskType::Scaffold)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskType::Scaffold => "scaffold",
            TaskType::Config => "config",
            TaskType::Types => "types",
            TaskType::Util => "util",
            TaskType::Api => "api",
            TaskType::Component => "component",
            TaskType::Page => "page",
            TaskType::Route => "route",
            TaskType::Style => "style",
            TaskType::Test => "test",
            TaskType::Integration => "integration",
        };
        write!(f, "{}", name)
    }
}

/// What a task does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    #[default]
    Create,
    Modify,
    Delete,
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Blocked` are terminal. `Blocked` only
/// arises when an ancestor fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    #[default]
    Pending,
    /// All dependencies completed, can be scheduled.
    Ready,
    /// Currently being executed by a worker.
    InProgress,
    /// Task completed successfully.
    Completed,
    /// Task failed permanently.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// An ancestor failed, so this task can never run.
    Blocked {
        /// Reason naming the failed ancestor.
        reason: String,
    },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Short name without the payload.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Task description as supplied by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub file_path: PathBuf,
    #[serde(default)]
    pub operation: FileOperation,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl TaskSpec {
    pub fn new(id: &str, task_type: TaskType, file_path: &str) -> Self {
        Self {
            id: TaskId::from(id),
            task_type,
            dependencies: Vec::new(),
            file_path: PathBuf::from(file_path),
            operation: FileOperation::Create,
            priority: None,
            estimated_duration_ms: None,
            max_attempts: None,
            description: String::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| TaskId::from(*d)).collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = Some(duration_ms);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What a finished task produced. Diagnostics only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub files_modified: Vec<PathBuf>,
    pub exports: Vec<String>,
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    pub task_type: TaskType,
    pub description: String,
    /// Tasks that must complete before this one is ready. Fixed at creation.
    dependencies: BTreeSet<TaskId>,
    pub file_path: PathBuf,
    pub operation: FileOperation,
    /// Current execution status.
    pub status: TaskStatus,
    /// Lower is more urgent.
    pub priority: u32,
    pub estimated_duration_ms: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent error, kept across retries.
    pub last_error: Option<String>,
    pub output: Option<TaskOutput>,
}

impl Task {
    /// Create a task from a planner spec.
    ///
    /// Priority and duration fall back to the task type's defaults and
    /// `default_max_attempts` is used when `spec.max_attempts` is unset.
    pub fn from_spec(spec: TaskSpec, default_max_attempts: u32) -> Self {
        let dependencies: BTreeSet<TaskId> = spec.dependencies.into_iter().collect();
        let status = if dependencies.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        Self {
            id: spec.id,
            priority: spec
                .priority
                .unwrap_or_else(|| spec.task_type.default_priority()),
            estimated_duration_ms: spec
                .estimated_duration_ms
                .unwrap_or_else(|| spec.task_type.default_duration_ms()),
            max_attempts: spec.max_attempts.unwrap_or(default_max_attempts).max(1),
            task_type: spec.task_type,
            description: spec.description,
            dependencies,
            file_path: spec.file_path,
            operation: spec.operation,
            status,
            attempts: 0,
            assigned_worker: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            output: None,
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<TaskId> {
        &self.dependencies
    }

    /// Paths that must be claimed before this task runs.
    ///
    /// Scaffold tasks claim the directory containing their file so that
    /// nothing else writes into a tree that is still being laid out.
    pub fn claimed_paths(&self) -> Vec<PathBuf> {
        if self.task_type.claims_directory() {
            let dir = self
                .file_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            vec![dir.to_path_buf()]
        } else {
            vec![self.file_path.clone()]
        }
    }

    /// Start an execution attempt on `worker`.
    pub fn start(&mut self, worker: WorkerId) {
        self.assigned_worker = Some(worker);
        self.begin_attempt();
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.status = TaskStatus::InProgress;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.last_error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Put the task back for another attempt after a failure.
    pub fn retry(&mut self, error: &str) {
        self.status = TaskStatus::Ready;
        self.assigned_worker = None;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    pub fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
