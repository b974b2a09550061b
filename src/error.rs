use thiserror::Error;

use crate::core::task::{TaskId, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<TaskId> },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Worker {worker} does not hold the execution lock for {task}")]
    LockNotHeld { task: TaskId, worker: WorkerId },

    #[error("File {path} is claimed by task {holder}")]
    ClaimConflict { path: String, holder: TaskId },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Invalid orchestrator state: {0}")]
    InvalidState(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
