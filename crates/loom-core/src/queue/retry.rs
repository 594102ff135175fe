//! Retry policy: decides whether a failed attempt is dispatched again.

/// Every engine failure is treated as retry-eligible; the policy only
/// bounds the number of dispatches. Timeouts, cancellations and shutdowns
/// are never retried.
///
/// `Retry` is a permission, not a guarantee: the re-enqueue takes a queue
/// slot like any submission, and a task whose retry finds the queue full
/// ends FAILED with the error of the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum dispatches per task, first attempt included.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue at the tail.
    Retry { next_attempt: u32 },
    /// Out of attempts; the failure is terminal.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Decide after attempt number `attempt` (1-indexed) failed.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_attempts {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}
