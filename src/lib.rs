pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manifest;
pub mod orchestration;

pub use crate::core::{DependencyGraph, ExecutionPlan, Task, TaskId, TaskSpec, TaskStatus, TaskType};
pub use error::{Error, Result};
pub use orchestration::{BuildResult, Orchestrator, OrchestratorConfig, WorkStealingQueue};
