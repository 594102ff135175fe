//! Domain model: ids, task record, status machine, log events.

pub mod events;
pub mod ids;
pub mod status;
pub mod task;

pub use events::{Channel, LogEvent, LogLevel};
pub use ids::{Id, IdMarker, ParseIdError, TaskId};
pub use status::TaskStatus;
pub use task::{
    FailureKind, InvalidTransition, TaskFailure, TaskMode, TaskRecord, TaskSnapshot, Transition,
};
