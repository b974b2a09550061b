//! Typed build event stream.
//!
//! The orchestrator and queue publish [`BuildEvent`]s on a broadcast
//! channel. Consumers (logging, notification layers) subscribe without the
//! scheduler knowing about them; publishing never blocks and events are
//! dropped when nobody is listening.

use crate::core::task::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Unique identifier for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BuildId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    TaskStarted {
        task_id: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        worker: WorkerId,
        files_modified: Vec<PathBuf>,
    },
    TaskFailed {
        task_id: TaskId,
        worker: WorkerId,
        error: String,
        attempt: u32,
        /// False once the task is exhausted.
        will_retry: bool,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskBlocked {
        task_id: TaskId,
        reason: String,
    },
    TaskStolen {
        task_id: TaskId,
        from: WorkerId,
        to: WorkerId,
    },
    TaskTimeout {
        task_id: TaskId,
        worker: WorkerId,
    },
    PhaseStarted {
        index: usize,
        name: String,
    },
    PhaseCompleted {
        index: usize,
        name: String,
    },
    Paused,
    Resumed,
    Completed {
        score: f64,
    },
    Failed {
        errors: Vec<String>,
    },
    Cancelled,
}

impl EventKind {
    /// Wire-style event name, e.g. `task:stolen`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskStarted { .. } => "task:started",
            EventKind::TaskCompleted { .. } => "task:completed",
            EventKind::TaskFailed { .. } => "task:failed",
            EventKind::TaskReady { .. } => "task:ready",
            EventKind::TaskBlocked { .. } => "task:blocked",
            EventKind::TaskStolen { .. } => "task:stolen",
            EventKind::TaskTimeout { .. } => "task:timeout",
            EventKind::PhaseStarted { .. } => "phaseStarted",
            EventKind::PhaseCompleted { .. } => "phaseCompleted",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
            EventKind::Cancelled => "cancelled",
        }
    }

    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventKind::TaskStarted { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::TaskReady { task_id }
            | EventKind::TaskBlocked { task_id, .. }
            | EventKind::TaskStolen { task_id, .. }
            | EventKind::TaskTimeout { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// A build event stamped with its build and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: BuildId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Publisher side of the event stream, cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    build_id: BuildId,
    tx: broadcast::Sender<BuildEvent>,
}

impl EventBus {
    pub fn new(build_id: BuildId) -> Self {
        Self::with_capacity(build_id, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(build_id: BuildId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { build_id, tx }
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never blocks; a send with no subscribers is dropped.
    pub fn emit(&self, kind: EventKind) {
        tracing::trace!(build = %self.build_id.short(), event = kind.name(), "event");
        let _ = self.tx.send(BuildEvent {
            build_id: self.build_id,
            at: Utc::now(),
            kind,
        });
    }
}
