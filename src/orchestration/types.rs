//! Type definitions for the delegation subsystem.
//!
//! These types form the shared vocabulary between the [`super::queue::TaskQueue`],
//! the [`super::spawner::ChildSpawner`], and the tool surface. All types derive
//! [`serde::Serialize`] for JSON tool responses.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DelegationError;

/// Sequential identifier assigned on admission to a queue.
///
/// Unique within one queue for its lifetime; meaningless across processes.
pub type TaskId = u64;

/// Lifecycle status of a queued task.
///
/// Legal transitions: Pending -> Running -> {Completed, Failed} and
/// Pending -> Cancelled. Nothing re-enters Pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of requested work, before or outside of queue admission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque text handed to the child as its one-shot message.
    pub description: String,
    /// Which specialized agent profile the child runs as.
    pub agent_kind: String,
    /// Higher runs first when drained from a queue.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Seeded into the child's private working-notes file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_context: Option<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, agent_kind: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            agent_kind: agent_kind.into(),
            priority: 0,
            working_directory: None,
            initial_context: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.initial_context = Some(context.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// A task admitted to a queue. Retained after completion for result lookup.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ChildResult>,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            spec,
            status: TaskStatus::Pending,
            result: None,
        }
    }

    /// Move to `next`, refusing transitions outside the lifecycle.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), DelegationError> {
        if !self.status.can_transition_to(next) {
            return Err(DelegationError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Exit status recorded when the child never produced one.
pub const NO_EXIT_STATUS: i32 = -1;

/// Outcome of one spawned child process.
///
/// `success == true` implies `error_message` is `None`; `output` never exceeds
/// the configured cap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub exit_status: i32,
    pub agent_kind: String,
    pub originating_task: String,
    /// Session allocated for the child; `None` when nothing was started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub elapsed_secs: f64,
}

impl ChildResult {
    /// A failure for `spec` that happened before or instead of a process run.
    pub fn rejected(spec: &TaskSpec, error: &DelegationError) -> Self {
        Self {
            success: false,
            output: String::new(),
            error_message: Some(error.to_string()),
            exit_status: NO_EXIT_STATUS,
            agent_kind: spec.agent_kind.clone(),
            originating_task: spec.description.clone(),
            session_id: None,
            elapsed_secs: 0.0,
        }
    }
}

/// Read-only snapshot of a queue and its recursion budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub max_queued: usize,
    pub max_parallel: usize,
    pub current_depth: u32,
    pub max_depth: u32,
    pub can_spawn: bool,
}
