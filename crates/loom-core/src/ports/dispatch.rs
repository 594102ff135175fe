//! ResultDispatcher port - delivery of finished ASYNC results to the caller.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::{TaskFailure, TaskId, TaskSnapshot, TaskStatus};

/// What gets delivered for one finished ASYNC task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    /// The submitter's delivery address, forwarded untouched so a broker
    /// consumer can route the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl Delivery {
    pub fn from_snapshot(snapshot: &TaskSnapshot) -> Self {
        Self {
            task_id: snapshot.id,
            status: snapshot.status,
            result: snapshot.result.clone(),
            error: snapshot.error.clone(),
            callback_url: snapshot.callback_url.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Called once per finished ASYNC task. Retries and ordering of the
/// delivery itself belong to the implementation.
#[async_trait]
pub trait ResultDispatcher: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError>;
}
