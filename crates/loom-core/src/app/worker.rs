//! WorkerPool - N engine workers draining the bounded queue.
//!
//! # フロー（1 タスク）
//! 1. `BoundedQueue::dequeue` で task_id 取得（閉じていれば終了）
//! 2. `TaskTable::claim` で試行開始（cancel 済みならスキップ）
//! 3. engine を別タスクで実行、timeout 付き
//! 4. 失敗なら `RetryPolicy` で再投入（キュー末尾）か終端かを決める
//! 5. `TaskTable::complete` で終端遷移、reporter へ通知
//!
//! # 同時実行数
//! engine の同時実行は常に worker 数以下。timeout した実行は abort し、
//! その future が drop されるのを待ってから次のタスクへ進む。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::reporter::LifecycleReporter;
use super::table::{Outcome, TaskTable};
use crate::domain::{TaskFailure, TaskId};
use crate::ports::{Engine, EngineError};
use crate::queue::{BoundedQueue, Dequeued, RetryDecision, RetryPolicy};

/// Everything a worker needs, shared by all of them.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub queue: Arc<BoundedQueue<TaskId>>,
    pub table: Arc<TaskTable>,
    pub engine: Arc<dyn Engine>,
    pub reporter: Arc<LifecycleReporter>,
    pub active: Arc<AtomicUsize>,
}

/// Worker pool handle.
/// - Closing the queue stops the workers once their current task is done.
/// - `join_within` waits for them; `abort` cancels whatever is left.
pub(crate) struct WorkerPool {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, ctx: WorkerContext) -> Self {
        let joins = (0..n)
            .map(|worker_id| {
                let ctx = ctx.clone();
                tokio::spawn(async move { worker_loop(worker_id, ctx).await })
            })
            .collect();
        Self { joins }
    }

    /// Wait for every worker to exit. `false` if `grace` ran out first.
    pub async fn join_within(&mut self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        // joined handles are dropped: a finished JoinHandle must not be polled again
        while let Some(join) = self.joins.last_mut() {
            if tokio::time::timeout_at(deadline, join).await.is_err() {
                return false;
            }
            self.joins.pop();
        }
        true
    }

    /// Cancel the workers still running and wait until they are gone.
    ///
    /// Dropping a worker drops its [`EngineRun`], which aborts the engine
    /// invocation it was waiting on.
    pub async fn abort(self) {
        for join in &self.joins {
            join.abort();
        }
        for join in self.joins {
            let _ = join.await;
        }
    }
}

/// Counts a worker as active while it runs a task.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Execution {
    Completed(serde_json::Value),
    Failed(String),
    TimedOut(Duration),
}

async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    tracing::debug!(worker_id, "engine worker started");

    loop {
        let task_id = match ctx.queue.dequeue().await {
            Dequeued::Item(id) => id,
            Dequeued::Shutdown => break,
        };

        // cancelled (or purged) while queued
        let Some(claimed) = ctx.table.claim(task_id) else {
            tracing::debug!(worker_id, %task_id, "skipping task no longer runnable");
            continue;
        };
        if let Some(t) = &claimed.transition {
            ctx.reporter.transition(t);
        }

        let execution = {
            let _busy = Busy::enter(&ctx.active);
            execute(&ctx.engine, claimed.payload, claimed.timeout).await
        };

        let outcome = match execution {
            Execution::Completed(value) => Outcome::Succeeded(value),
            Execution::TimedOut(limit) => Outcome::TimedOut(TaskFailure::timeout(limit)),
            Execution::Failed(message) => {
                match RetryPolicy::new(claimed.max_attempts).decide(claimed.attempt) {
                    // A retry competes with new submissions for queue space:
                    // if the queue is full (or closed) the task ends FAILED
                    // with this attempt's error, attempts left or not.
                    RetryDecision::Retry { next_attempt } => match ctx.queue.enqueue(task_id) {
                        Ok(()) => {
                            ctx.reporter.retry_scheduled(task_id, next_attempt, &message);
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!(%task_id, error = %e, "retry not scheduled");
                            Outcome::Failed(TaskFailure::engine(message))
                        }
                    },
                    RetryDecision::GiveUp => Outcome::Failed(TaskFailure::engine(message)),
                }
            }
        };

        match ctx.table.complete(task_id, outcome) {
            Some(finished) => ctx.reporter.finished(finished),
            None => {
                tracing::debug!(worker_id, %task_id, "task already finished, outcome discarded")
            }
        }
    }

    tracing::debug!(worker_id, "engine worker stopped");
}

/// An engine invocation on its own task. Dropping it aborts the task, so
/// a worker that is itself aborted does not leave the engine running.
struct EngineRun(JoinHandle<Result<serde_json::Value, EngineError>>);

impl Drop for EngineRun {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run the engine on its own task so a panic becomes a failure and a
/// timed-out invocation can be cancelled.
async fn execute(
    engine: &Arc<dyn Engine>,
    payload: Arc<serde_json::Value>,
    timeout: Option<Duration>,
) -> Execution {
    let engine = Arc::clone(engine);
    let mut run = EngineRun(tokio::spawn(async move { engine.run(payload).await }));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut run.0).await {
            Ok(joined) => joined,
            Err(_) => {
                run.0.abort();
                // wait for the engine future to be dropped; one that never
                // yields keeps this worker here until it returns
                let _ = (&mut run.0).await;
                return Execution::TimedOut(limit);
            }
        },
        None => (&mut run.0).await,
    };

    match joined {
        Ok(Ok(value)) => Execution::Completed(value),
        Ok(Err(e)) => Execution::Failed(e.message().to_string()),
        Err(e) if e.is_panic() => Execution::Failed(format!("engine panicked: {e}")),
        Err(e) => Execution::Failed(format!("engine task aborted: {e}")),
    }
}
