//! TaskTable - every tracked task, its waiters, and its retention state.
//!
//! All record mutations happen under one lock and are single method calls
//! on `TaskRecord`, so readers always see a consistent snapshot.
//!
//! # 不変条件
//! - 状態遷移は `TaskRecord` のメソッド経由のみ（ロック内で 1 回の呼び出し）
//! - 終端状態（SUCCEEDED / FAILED / TIMEOUT）に入ったレコードは二度と変わらない
//! - 終端遷移のたびに `Notify::notify_waiters` を呼ぶ（purge 時も）
//! - ロックを保持したまま await しない、外部（sink / dispatcher）を呼ばない
//!
//! # フロー
//! 1. `insert` - submit が PENDING レコードを登録（キューへ push する前）
//! 2. `claim` - worker が試行を開始（PENDING → RUNNING、retry 時は attempt のみ加算）
//! 3. `complete` / `cancel` / `fail_unfinished` - 終端遷移、待機者を起こす
//! 4. `wait_terminal` - `await_result` が終端まで待つ
//! 5. `mark_released` → `purge` - 結果が消費されたら短い保持期間で削除
//!
//! # 保持期間
//! | 状態 | 保持 |
//! |------|------|
//! | 未終端 | 削除しない |
//! | 終端 + released（await 済み / 配送済み） | `released` |
//! | 終端 + 未 released | `orphaned` |
//!
//! # 例
//! ```ignore
//! let table = TaskTable::new(clock);
//! table.insert(record);
//! let claimed = table.claim(id).expect("pending task");
//! let finished = table.complete(id, Outcome::Succeeded(json!("ok")));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::domain::{
    TaskFailure, TaskId, TaskMode, TaskRecord, TaskSnapshot, TaskStatus, Transition,
};
use crate::error::TaskError;
use crate::observability::StatusCounts;
use crate::ports::Clock;

struct Entry {
    record: TaskRecord,
    /// Fired once, on the terminal transition (and on purge).
    notify: Arc<Notify>,
    /// The result reached its consumer: awaited, or delivered.
    released: bool,
}

impl Entry {
    fn new(record: TaskRecord) -> Self {
        Self {
            record,
            notify: Arc::new(Notify::new()),
            released: false,
        }
    }
}

/// What a worker gets from a successful claim.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub payload: Arc<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub attempt: u32,
    pub max_attempts: u32,
    /// `Some` on the first attempt (PENDING -> RUNNING), `None` on a retry.
    pub transition: Option<Transition>,
}

/// How an execution ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded(serde_json::Value),
    Failed(TaskFailure),
    TimedOut(TaskFailure),
}

/// A terminal transition together with the state it produced.
#[derive(Debug, Clone)]
pub struct Finished {
    pub transition: Transition,
    pub snapshot: TaskSnapshot,
}

/// A cancelled task and the status it was cancelled from.
#[derive(Debug, Clone)]
pub struct CancelledTask {
    pub previous: TaskStatus,
    pub finished: Finished,
}

pub struct TaskTable {
    entries: Mutex<HashMap<TaskId, Entry>>,
    clock: Arc<dyn Clock>,
}

impl TaskTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Track a new PENDING record. Returns its creation transition.
    ///
    /// The id must not be queued yet: a worker that dequeues an id the
    /// table does not know drops it.
    pub fn insert(&self, record: TaskRecord) -> Transition {
        let created = record.created();
        self.lock().insert(record.id(), Entry::new(record));
        created
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.lock().get(&id).map(|e| e.record.snapshot())
    }

    pub fn mode(&self, id: TaskId) -> Option<TaskMode> {
        self.lock().get(&id).map(|e| e.record.mode())
    }

    /// Start the next attempt of `id`. `None` if the task is gone or was
    /// finished (cancelled) while it sat in the queue.
    pub fn claim(&self, id: TaskId) -> Option<Claimed> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let record = &mut entries.get_mut(&id)?.record;
        let transition = record.begin_attempt(now).ok()?;
        Some(Claimed {
            payload: Arc::clone(record.payload()),
            timeout: record.timeout(),
            attempt: record.attempt(),
            max_attempts: record.max_attempts(),
            transition,
        })
    }

    /// Apply a worker's outcome. `None` when the task already reached a
    /// terminal state (cancelled or failed by shutdown); the outcome is
    /// then discarded.
    pub fn complete(&self, id: TaskId, outcome: Outcome) -> Option<Finished> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.get_mut(&id)?;
        let transition = match outcome {
            Outcome::Succeeded(value) => entry.record.succeed(value, now),
            Outcome::Failed(failure) => entry.record.fail(failure, now),
            Outcome::TimedOut(failure) => entry.record.time_out(failure, now),
        }
        .ok()?;
        entry.notify.notify_waiters();
        Some(Finished {
            transition,
            snapshot: entry.record.snapshot(),
        })
    }

    /// Mark a non-terminal task FAILED/cancelled.
    pub fn cancel(&self, id: TaskId) -> Result<CancelledTask, TaskError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        let previous = entry.record.status();
        let transition = entry
            .record
            .fail(TaskFailure::cancelled(), now)
            .map_err(|e| TaskError::AlreadyFinished {
                task_id: id,
                status: e.from,
            })?;
        entry.notify.notify_waiters();
        Ok(CancelledTask {
            previous,
            finished: Finished {
                transition,
                snapshot: entry.record.snapshot(),
            },
        })
    }

    /// Fail every task not yet terminal. Used at shutdown.
    pub fn fail_unfinished(&self, reason: &str) -> Vec<Finished> {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries
            .values_mut()
            .filter(|e| !e.record.status().is_terminal())
            .filter_map(|entry| {
                let transition = entry
                    .record
                    .fail(TaskFailure::shutdown(reason), now)
                    .ok()?;
                entry.notify.notify_waiters();
                Some(Finished {
                    transition,
                    snapshot: entry.record.snapshot(),
                })
            })
            .collect()
    }

    /// Wait until `id` is terminal. `None` if the task is unknown or is
    /// purged while waiting.
    pub async fn wait_terminal(&self, id: TaskId) -> Option<TaskSnapshot> {
        loop {
            let notify = {
                let entries = self.lock();
                let entry = entries.get(&id)?;
                if entry.record.status().is_terminal() {
                    return Some(entry.record.snapshot());
                }
                Arc::clone(&entry.notify)
            };

            // Create the notified future before re-checking, so a terminal
            // transition in between still wakes us.
            let notified = notify.notified();
            {
                let entries = self.lock();
                let entry = entries.get(&id)?;
                if entry.record.status().is_terminal() {
                    return Some(entry.record.snapshot());
                }
            }
            notified.await;
        }
    }

    /// The result reached its consumer; shortens retention.
    pub fn mark_released(&self, id: TaskId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.released = true;
        }
    }

    /// Drop terminal tasks past their retention window. Returns how many.
    pub fn purge(&self, released: Duration, orphaned: Duration) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let Some(finished_at) = entry.record.finished_at() else {
                return true;
            };
            let keep_for = if entry.released { released } else { orphaned };
            // negative ages (clock skew) count as fresh
            let age = (now - finished_at).to_std().unwrap_or_default();
            let keep = age < keep_for;
            if !keep {
                entry.notify.notify_waiters();
            }
            keep
        });
        before - entries.len()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.lock().values() {
            counts.record(entry.record.status());
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
