//! Queue module: the bounded FIFO between submission and the worker pool,
//! plus the retry policy applied when an attempt fails.

mod bounded;
mod retry;

pub use bounded::{BoundedQueue, Dequeued, EnqueueError, Permit};
pub use retry::{RetryDecision, RetryPolicy};
