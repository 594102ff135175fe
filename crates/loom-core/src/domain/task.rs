//! Task record: identity, payload, and lifecycle state of one unit of work.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::status::TaskStatus;

/// How the submitter receives the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    /// The submitter waits on `await_result`.
    Sync,
    /// The result is pushed through the result dispatcher.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Engine,
    Timeout,
    Cancelled,
    Shutdown,
}

/// Error detail stored on a FAILED or TIMED_OUT task. The message is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    fn new(kind: FailureKind, message: String) -> Self {
        let message = if message.trim().is_empty() {
            format!("{kind:?} failure without detail").to_lowercase()
        } else {
            message
        };
        Self { kind, message }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Engine, message.into())
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("execution exceeded {}ms", limit.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled".to_string())
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Shutdown, reason.into())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One recorded status change. `from` is `None` for the initial PENDING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task_id: TaskId,
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Read-only view of a task, taken under the table lock so status and
/// timestamps always agree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// Where the submitter wants an ASYNC result sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// The mutable task record.
///
/// Fields are private: every mutation goes through a transition method so
/// that the status/timestamp/result invariants hold at every point a reader
/// can observe.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    id: TaskId,
    payload: Arc<serde_json::Value>,
    mode: TaskMode,
    status: TaskStatus,
    timeout: Option<Duration>,
    max_attempts: u32,
    /// Dispatch count, including the current attempt while RUNNING.
    attempt: u32,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    error: Option<TaskFailure>,
    callback_url: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        payload: serde_json::Value,
        mode: TaskMode,
        timeout: Option<Duration>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload: Arc::new(payload),
            mode,
            status: TaskStatus::Pending,
            timeout,
            max_attempts,
            attempt: 0,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            callback_url: None,
        }
    }

    /// Attach the address an ASYNC result is delivered to. Set once, at
    /// submission.
    pub fn with_callback_url(mut self, callback_url: Option<String>) -> Self {
        self.callback_url = callback_url;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &Arc<serde_json::Value> {
        &self.payload
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TaskFailure> {
        self.error.as_ref()
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    /// The transition recorded at creation.
    pub fn created(&self) -> Transition {
        Transition {
            task_id: self.id,
            from: None,
            to: TaskStatus::Pending,
            at: self.submitted_at,
            attempt: 0,
        }
    }

    /// Start a dispatch. The first one moves PENDING -> RUNNING and returns
    /// the transition; a retry only bumps the attempt counter.
    pub fn begin_attempt(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, InvalidTransition> {
        match self.status {
            TaskStatus::Pending => {
                let transition = self.apply(TaskStatus::Running, now)?;
                self.started_at = Some(now);
                self.attempt = 1;
                Ok(Some(Transition {
                    attempt: 1,
                    ..transition
                }))
            }
            TaskStatus::Running => {
                self.attempt += 1;
                Ok(None)
            }
            from => Err(InvalidTransition {
                from,
                to: TaskStatus::Running,
            }),
        }
    }

    pub fn succeed(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        let transition = self.apply(TaskStatus::Succeeded, now)?;
        self.result = Some(result);
        self.finished_at = Some(now);
        Ok(transition)
    }

    pub fn fail(
        &mut self,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        let transition = self.apply(TaskStatus::Failed, now)?;
        self.error = Some(failure);
        self.finished_at = Some(now);
        Ok(transition)
    }

    pub fn time_out(
        &mut self,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        let transition = self.apply(TaskStatus::TimedOut, now)?;
        self.error = Some(failure);
        self.finished_at = Some(now);
        Ok(transition)
    }

    fn apply(
        &mut self,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        self.status = to;
        Ok(Transition {
            task_id: self.id,
            from: Some(from),
            to,
            at: now,
            attempt: self.attempt,
        })
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            mode: self.mode,
            status: self.status,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result: self.result.clone(),
            error: self.error.clone(),
            callback_url: self.callback_url.clone(),
        }
    }
}
