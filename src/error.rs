use std::path::PathBuf;

use crate::orchestration::types::{TaskId, TaskStatus};

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid config value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Errors related to launching and supervising a child process.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn process `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process wait failed: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// Errors related to session directories and shared state files.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create session directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session `{id}` not found under {base}")]
    NotFound { id: String, base: PathBuf },

    #[error("Invalid session id `{0}`")]
    InvalidId(String),

    #[error("Invalid agent kind `{0}`: use letters, digits, '-', '_' or '.'")]
    InvalidAgentKind(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Delegation failures surfaced to callers of the queue and spawner.
///
/// Timeouts, launch failures and cancellations end up as text in a failed
/// [`crate::orchestration::types::ChildResult`]; capacity and depth errors are
/// raised before any worker slot or process is used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    #[error("task queue is full ({max} pending tasks); execute or clear the queue first")]
    Capacity { max: usize },

    #[error("max delegation depth reached (depth {depth} >= max {max}); cannot spawn a child agent")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("child process timed out after {timeout_secs}s and was terminated")]
    TimedOut { timeout_secs: u64 },

    #[error("failed to launch child process: {0}")]
    SpawnFailed(String),

    #[error("child process was cancelled by parent shutdown")]
    Cancelled,

    #[error("illegal task transition {from:?} -> {to:?}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("unknown task id {0}")]
    UnknownTask(TaskId),
}

/// A batch enqueue that stopped part-way. Tasks admitted before the failure
/// stay queued; `enqueued` lists them so the caller can account for them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} ({} of {attempted} tasks were queued before the failure)", .enqueued.len())]
pub struct BatchEnqueueError {
    pub enqueued: Vec<TaskId>,
    pub attempted: usize,
    #[source]
    pub error: DelegationError,
}
