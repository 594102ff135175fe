use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Queue statistics, computed on demand. Field names follow the
/// `/api/v1/queue/stats` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks currently waiting in the queue.
    pub queue_size: usize,
    pub max_queue_size: usize,
    /// Workers currently executing a task.
    pub active_workers: usize,
    pub max_workers: usize,
    /// Submissions accepted since construction (retries not counted).
    pub total_tasks: u64,
    pub is_started: bool,
}

/// Tally of tracked tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::TimedOut => self.timed_out += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_serialize_with_api_field_names() {
        let stats = QueueStats {
            queue_size: 3,
            max_queue_size: 10,
            active_workers: 1,
            max_workers: 2,
            total_tasks: 7,
            is_started: true,
        };
        let v = serde_json::to_value(stats).unwrap();
        for key in [
            "queue_size",
            "max_queue_size",
            "active_workers",
            "max_workers",
            "total_tasks",
            "is_started",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn counts_tally_each_status() {
        let mut counts = StatusCounts::default();
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::TimedOut,
        ] {
            counts.record(s);
        }
        assert_eq!(counts.running, 2);
        assert_eq!(counts.timed_out, 1);
        assert_eq!(counts.total(), 4);
    }
}
