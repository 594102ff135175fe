//! TaskManager - submission, waiting, status, cancellation, statistics.
//!
//! # フロー（submit）
//! 1. closing なら `ShuttingDown`
//! 2. `BoundedQueue::try_reserve` でキューの空きを 1 つ予約（満杯なら `QueueFull`）
//! 3. `TaskTable::insert` で PENDING レコードを登録
//! 4. 作成遷移と "task submitted" を記録（テーブルのロック外）
//! 5. 予約した枠へ task_id を push - ここで初めて worker から見える
//!
//! 記録（4）が push（5）より前なので、作成遷移は必ず最初の claim より先に出る。
//! 予約の後に queue が閉じた場合、タスクは shutdown 失敗として終端に入る。
//!
//! # フロー（shutdown）
//! 1. 新規受付を止め、キューを閉じる
//! 2. キューに残っていたタスクを FAILED/shutdown にする
//! 3. 実行中の worker を grace 期間だけ待つ、超えたら abort
//! 4. 残った未終端タスクを FAILED/shutdown にし、GC を止める
//!
//! # 例
//! ```ignore
//! let manager = TaskManagerBuilder::new(config).engine(engine).build()?;
//! manager.start()?;
//! let id = manager.submit(json!({"name": "kamo"}), TaskMode::Sync, None)?;
//! let value = manager.await_result(id, Duration::from_secs(5)).await?;
//! manager.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;

use super::gc_loop::{GcLoop, Retention};
use super::reporter::LifecycleReporter;
use super::table::{Outcome, TaskTable};
use super::worker::{WorkerContext, WorkerPool};
use crate::config::ManagerConfig;
use crate::domain::{
    LogLevel, TaskFailure, TaskId, TaskMode, TaskRecord, TaskSnapshot, TaskStatus,
};
use crate::error::TaskError;
use crate::observability::{QueueStats, StatusCounts};
use crate::ports::{Clock, Engine, IdGenerator};
use crate::queue::{BoundedQueue, EnqueueError};

/// What a successful `cancel` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The task was still PENDING: it never reaches the engine.
    ///
    /// A worker may already have dequeued the id without claiming it yet;
    /// its claim then fails and the id is dropped. In that window the id
    /// was not in the queue to remove, so `queue_size` was already lower.
    Dequeued,
    /// The task was RUNNING: the record is FAILED/cancelled, but the engine
    /// invocation already under way is not interrupted and its result is
    /// discarded.
    MarkedOnly,
}

#[derive(Default)]
struct Lifecycle {
    workers: Option<WorkerPool>,
    gc: Option<GcLoop>,
}

/// Front door of the queue.
///
/// `submit`, `get_status`, `cancel` and `stats` never wait; `await_result`
/// waits on the task, bounded by the caller's deadline. Configuration is
/// copied in at construction and never changes.
pub struct TaskManager {
    config: ManagerConfig,
    queue: Arc<BoundedQueue<TaskId>>,
    table: Arc<TaskTable>,
    engine: Arc<dyn Engine>,
    reporter: Arc<LifecycleReporter>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    active: Arc<AtomicUsize>,
    total: AtomicU64,
    started: AtomicBool,
    closing: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

/// Per-task knobs for [`TaskManager::submit_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Overrides the configured task timeout; zero counts as not given.
    pub timeout: Option<Duration>,
    /// Delivery address carried with an ASYNC result. Ignored for SYNC
    /// tasks, whose result goes to `await_result`.
    pub callback_url: Option<String>,
}

impl SubmitOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

pub(crate) struct Parts {
    pub config: ManagerConfig,
    pub table: Arc<TaskTable>,
    pub engine: Arc<dyn Engine>,
    pub reporter: Arc<LifecycleReporter>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

impl TaskManager {
    pub(crate) fn from_parts(parts: Parts) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(parts.config.queue_capacity)),
            config: parts.config,
            table: parts.table,
            engine: parts.engine,
            reporter: parts.reporter,
            ids: parts.ids,
            clock: parts.clock,
            active: Arc::new(AtomicUsize::new(0)),
            total: AtomicU64::new(0),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Spawn the workers and the GC loop. Calling it again is a no-op.
    ///
    /// Tasks submitted before `start` wait in the queue.
    pub fn start(&self) -> Result<(), TaskError> {
        let mut lifecycle = self.lifecycle();
        if self.closing.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }
        if lifecycle.workers.is_some() {
            return Ok(());
        }

        lifecycle.workers = Some(WorkerPool::spawn(
            self.config.engine_workers,
            WorkerContext {
                queue: Arc::clone(&self.queue),
                table: Arc::clone(&self.table),
                engine: Arc::clone(&self.engine),
                reporter: Arc::clone(&self.reporter),
                active: Arc::clone(&self.active),
            },
        ));
        lifecycle.gc = Some(GcLoop::spawn(
            Arc::clone(&self.table),
            Retention {
                released: self.config.retention,
                orphaned: self.config.orphan_retention,
                interval: self.config.gc_interval,
            },
        ));
        self.started.store(true, Ordering::SeqCst);

        self.reporter.logger().service(
            LogLevel::Info,
            "task manager started",
            None,
            json!({
                "engine_workers": self.config.engine_workers,
                "queue_capacity": self.config.queue_capacity,
            }),
        );
        Ok(())
    }

    /// Queue a task. Never waits: a full queue is `QueueFull`.
    ///
    /// `timeout` overrides the configured default; a zero timeout counts as
    /// not given.
    pub fn submit(
        &self,
        payload: serde_json::Value,
        mode: TaskMode,
        timeout: Option<Duration>,
    ) -> Result<TaskId, TaskError> {
        self.submit_with(
            payload,
            mode,
            SubmitOptions {
                timeout,
                ..SubmitOptions::default()
            },
        )
    }

    /// `submit` with per-task options.
    pub fn submit_with(
        &self,
        payload: serde_json::Value,
        mode: TaskMode,
        options: SubmitOptions,
    ) -> Result<TaskId, TaskError> {
        if self.closing.load(Ordering::SeqCst) {
            self.reporter.rejected("shutting down");
            return Err(TaskError::ShuttingDown);
        }

        let permit = match self.queue.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                let err = match e {
                    EnqueueError::Full { capacity } => TaskError::QueueFull { capacity },
                    EnqueueError::Closed => TaskError::ShuttingDown,
                };
                self.reporter.rejected(&err.to_string());
                return Err(err);
            }
        };

        let id = self.ids.generate_task_id();
        let timeout = options
            .timeout
            .filter(|t| !t.is_zero())
            .or(self.config.task_timeout);
        let callback_url = options
            .callback_url
            .filter(|url| mode == TaskMode::Async && !url.is_empty());
        let record = TaskRecord::new(
            id,
            payload,
            mode,
            timeout,
            self.config.max_attempts,
            self.clock.now(),
        )
        .with_callback_url(callback_url);

        let created = self.table.insert(record);
        self.reporter.submitted(&created, mode);
        self.total.fetch_add(1, Ordering::Relaxed);

        if permit.push(id).is_err() {
            // closed between the reservation and the push
            let failure = TaskFailure::shutdown("task manager shut down before the task ran");
            if let Some(finished) = self.table.complete(id, Outcome::Failed(failure)) {
                self.reporter.finished(finished);
            }
        }
        Ok(id)
    }

    /// Wait for a SYNC task's result, at most `deadline`.
    ///
    /// Running out of time is `AwaitTimeout` and leaves the task alone; it
    /// can still be awaited or queried later.
    pub async fn await_result(
        &self,
        id: TaskId,
        deadline: Duration,
    ) -> Result<serde_json::Value, TaskError> {
        match self.table.mode(id) {
            None => return Err(TaskError::NotFound(id)),
            Some(TaskMode::Async) => return Err(TaskError::NotAwaitable(id)),
            Some(TaskMode::Sync) => {}
        }

        let snapshot = match tokio::time::timeout(deadline, self.table.wait_terminal(id)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Err(TaskError::NotFound(id)),
            Err(_) => {
                return Err(TaskError::AwaitTimeout {
                    task_id: id,
                    waited: deadline,
                });
            }
        };

        self.table.mark_released(id);
        match (snapshot.status, snapshot.result, snapshot.error) {
            (TaskStatus::Succeeded, Some(result), _) => Ok(result),
            (_, _, Some(failure)) => Err(TaskError::from_failure(id, &failure)),
            (status, _, _) => Err(TaskError::EngineExecution(format!(
                "task finished as {status} without detail"
            ))),
        }
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskSnapshot, TaskError> {
        self.table.snapshot(id).ok_or(TaskError::NotFound(id))
    }

    /// Cancel a task that has not finished.
    ///
    /// A PENDING task is taken out of the queue and never reaches the
    /// engine. A RUNNING task is only marked; see [`Cancellation::MarkedOnly`].
    ///
    /// The answer follows the record's status, not whether the id was still
    /// queued: a PENDING task a worker has dequeued but not yet claimed is
    /// still `Dequeued`, since that claim fails.
    pub fn cancel(&self, id: TaskId) -> Result<Cancellation, TaskError> {
        let cancelled = self.table.cancel(id)?;
        // a RUNNING task may also be queued, waiting for its retry
        let dequeued = self.queue.remove_where(|queued| *queued == id).is_some();
        tracing::debug!(task_id = %id, previous = %cancelled.previous, dequeued, "task cancelled");

        let cancellation = match cancelled.previous {
            TaskStatus::Pending => Cancellation::Dequeued,
            _ => Cancellation::MarkedOnly,
        };
        self.reporter.finished(cancelled.finished);
        Ok(cancellation)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.queue.len(),
            max_queue_size: self.queue.capacity(),
            active_workers: self.active.load(Ordering::SeqCst),
            max_workers: self.config.engine_workers,
            total_tasks: self.total.load(Ordering::Relaxed),
            is_started: self.started.load(Ordering::SeqCst),
        }
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.table.counts()
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown(&self) {
        self.shutdown_with(self.config.shutdown_grace).await;
    }

    /// Stop accepting work, fail what is still queued, give in-flight tasks
    /// `grace` to finish, then fail whatever is left.
    pub async fn shutdown_with(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Lifecycle { workers, gc } = std::mem::take(&mut *self.lifecycle());

        let drained = self.queue.close();
        tracing::info!(drained = drained.len(), "task queue closed");
        for id in drained {
            let failure = TaskFailure::shutdown("task manager shut down before the task ran");
            if let Some(finished) = self.table.complete(id, Outcome::Failed(failure)) {
                self.reporter.finished(finished);
            }
        }

        if let Some(mut workers) = workers
            && !workers.join_within(grace).await
        {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "workers still busy after grace period, aborting");
            workers.abort().await;
        }
        for finished in self
            .table
            .fail_unfinished("shutdown grace period elapsed before the task finished")
        {
            self.reporter.finished(finished);
        }

        if let Some(gc) = gc {
            gc.stop().await;
        }
        self.started.store(false, Ordering::SeqCst);
        self.reporter
            .logger()
            .service(LogLevel::Info, "task manager stopped", None, json!({}));
    }
}
