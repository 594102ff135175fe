//! EventSink port - destination of structured lifecycle events.
//!
//! The task manager decides which channel an event goes to; sinks decide
//! everything else (format, retention, destination).

use crate::domain::LogEvent;

pub trait EventSink: Send + Sync {
    /// Must not block: called from worker loops and from `submit`.
    ///
    /// Never called with the task table locked, but events of one task are
    /// emitted in transition order.
    fn emit(&self, event: &LogEvent);
}
