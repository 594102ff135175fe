//! Engine port - the algorithm callable a worker invokes for each task.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Error raised by the engine callable. Captured into the task's FAILED state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for EngineError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for EngineError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// The inference engine.
///
/// The payload is shared, not copied, across retry attempts. An invocation
/// that outlives its task timeout is cancelled at its next `.await`: its
/// future is dropped and the worker waits for that before taking more work.
/// An engine that never yields (blocking or CPU-bound code without
/// `spawn_blocking` and an await point) cannot be stopped, and the worker
/// stays occupied until it returns.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn run(
        &self,
        payload: Arc<serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError>;
}

/// Adapts an async closure into an [`Engine`].
pub struct FnEngine<F> {
    f: F,
}

impl<F> FnEngine<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn arc<Fut>(f: F) -> Arc<dyn Engine>
    where
        F: Fn(Arc<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, EngineError>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl<F, Fut> Engine for FnEngine<F>
where
    F: Fn(Arc<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, EngineError>> + Send + 'static,
{
    async fn run(
        &self,
        payload: Arc<serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError> {
        (self.f)(payload).await
    }
}
