//! Orchestration layer for kiln builds.
//!
//! This module provides the work-stealing queue that distributes tasks over
//! a fixed worker pool, the file claims that keep workers from writing the
//! same paths, the collaborator traits that perform generation and
//! verification, and the orchestrator that ties them to the dependency graph.

pub mod claims;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod queue;

pub use claims::{ClaimGuard, FileClaims, DEFAULT_CLAIM_TIMEOUT};
pub use events::{BuildEvent, BuildId, EventBus, EventKind};
pub use executor::{
    CodeGenerator, CommandGenerator, CommandVerifier, GenerationOutput, LocalSandbox,
    NoopVerifier, Sandbox, VerificationReport, Verifier,
};
pub use orchestrator::{
    format_duration, BlockedTask, BuildResult, BuildStatus, Orchestrator, OrchestratorConfig,
    OrchestratorState, Progress, TaskFailure,
};
pub use queue::{
    Assignment, FailOutcome, QueueConfig, QueueReason, QueuedTask, TimedOut, WorkStealingQueue,
    WorkerState, WorkerStats,
};
