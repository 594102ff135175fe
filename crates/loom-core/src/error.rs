use std::time::Duration;

use thiserror::Error;

use crate::domain::{FailureKind, TaskFailure, TaskId, TaskStatus};

/// Errors returned by the task manager's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Submission rejected; the caller must back off.
    #[error("task queue is full (capacity={capacity})")]
    QueueFull { capacity: usize },

    /// The sync wait elapsed. The task itself keeps going.
    #[error("gave up waiting for {task_id} after {}ms", .waited.as_millis())]
    AwaitTimeout { task_id: TaskId, waited: Duration },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("engine execution failed: {0}")]
    EngineExecution(String),

    #[error("task timed out: {0}")]
    TimeoutExpired(String),

    #[error("{0} was cancelled")]
    Cancelled(TaskId),

    #[error("task manager is shutting down")]
    ShuttingDown,

    /// `await_result` on an ASYNC task.
    #[error("{0} was submitted in async mode; its result goes to the result dispatcher")]
    NotAwaitable(TaskId),

    #[error("{task_id} already finished with status {status}")]
    AlreadyFinished { task_id: TaskId, status: TaskStatus },
}

impl TaskError {
    /// Maps a terminal task's stored failure to the error `await_result` returns.
    pub fn from_failure(task_id: TaskId, failure: &TaskFailure) -> Self {
        match failure.kind {
            FailureKind::Engine => TaskError::EngineExecution(failure.message.clone()),
            FailureKind::Timeout => TaskError::TimeoutExpired(failure.message.clone()),
            FailureKind::Cancelled => TaskError::Cancelled(task_id),
            FailureKind::Shutdown => TaskError::ShuttingDown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("unsupported {key} backend {value:?}")]
    Unsupported { key: &'static str, value: String },
}

/// Errors from assembling a task manager.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no engine registered; call TaskManagerBuilder::engine before build")]
    MissingEngine,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
