//! LifecycleReporter - turns task transitions into log events and ASYNC
//! deliveries.

use std::sync::Arc;

use serde_json::json;

use super::logger::DualLogger;
use super::table::{Finished, TaskTable};
use crate::domain::{LogLevel, TaskId, TaskMode, TaskStatus, Transition};
use crate::ports::{Delivery, ResultDispatcher};

pub struct LifecycleReporter {
    logger: DualLogger,
    dispatcher: Option<Arc<dyn ResultDispatcher>>,
    table: Arc<TaskTable>,
}

impl LifecycleReporter {
    pub fn new(
        logger: DualLogger,
        dispatcher: Option<Arc<dyn ResultDispatcher>>,
        table: Arc<TaskTable>,
    ) -> Self {
        Self {
            logger,
            dispatcher,
            table,
        }
    }

    pub fn logger(&self) -> &DualLogger {
        &self.logger
    }

    /// Creation transition plus the service-channel submission line.
    pub fn submitted(&self, created: &Transition, mode: TaskMode) {
        self.transition(created);
        self.logger.service(
            LogLevel::Info,
            "task submitted",
            Some(created.task_id),
            json!({ "mode": mode, "status": created.to }),
        );
    }

    pub fn rejected(&self, reason: &str) {
        self.logger.service(
            LogLevel::Warn,
            "task rejected",
            None,
            json!({ "reason": reason }),
        );
    }

    /// One debug event per status change.
    pub fn transition(&self, t: &Transition) {
        self.logger.debug(
            LogLevel::Debug,
            "status transition",
            Some(t.task_id),
            json!({
                "old_status": t.from,
                "new_status": t.to,
                "attempt": t.attempt,
                "timestamp": t.at.to_rfc3339(),
            }),
        );
    }

    pub fn retry_scheduled(&self, task_id: TaskId, next_attempt: u32, error: &str) {
        self.logger.debug(
            LogLevel::Info,
            "retry scheduled",
            Some(task_id),
            json!({
                "failed_attempt": next_attempt - 1,
                "next_attempt": next_attempt,
                "error": error,
            }),
        );
    }

    /// Terminal transition: debug event, service outcome line, and the
    /// single delivery of an ASYNC result.
    pub fn finished(&self, finished: Finished) {
        let Finished {
            transition,
            snapshot,
        } = finished;
        self.transition(&transition);

        let level = match snapshot.status {
            TaskStatus::Succeeded => LogLevel::Info,
            TaskStatus::TimedOut => LogLevel::Warn,
            _ => LogLevel::Error,
        };
        let elapsed_ms = snapshot
            .finished_at
            .zip(snapshot.started_at.or(Some(snapshot.submitted_at)))
            .map(|(end, start)| (end - start).num_milliseconds());
        self.logger.service(
            level,
            "task finished",
            Some(snapshot.id),
            json!({
                "status": snapshot.status,
                "attempts": snapshot.attempt,
                "elapsed_ms": elapsed_ms,
                "error": snapshot.error.as_ref().map(|e| e.message.as_str()),
            }),
        );

        if snapshot.mode == TaskMode::Async {
            self.dispatch(Delivery::from_snapshot(&snapshot));
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            // nobody to deliver to; the result stays queryable until purged
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(task_id = %delivery.task_id, "no runtime available, result not delivered");
            return;
        };

        let table = Arc::clone(&self.table);
        let logger = self.logger.clone();
        handle.spawn(async move {
            let task_id = delivery.task_id;
            match dispatcher.deliver(delivery).await {
                Ok(()) => table.mark_released(task_id),
                Err(e) => logger.service(
                    LogLevel::Error,
                    "result delivery failed",
                    Some(task_id),
                    json!({ "error": e.to_string() }),
                ),
            }
        });
    }
}
