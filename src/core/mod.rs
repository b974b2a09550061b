//! Core domain models for build scheduling.
//!
//! This module contains the task model, the dependency graph and the
//! phased execution plan derived from it.

pub mod dag;
pub mod plan;
pub mod task;

pub use dag::{DependencyGraph, StatusChange, StatusCounts, ValidationIssue, ValidationReport};
pub use plan::{ExecutionPhase, ExecutionPlan};
pub use task::{FileOperation, Task, TaskId, TaskOutput, TaskSpec, TaskStatus, TaskType, WorkerId};
