//! App - the running task manager and what it is made of.

pub mod builder;
mod gc_loop;
pub mod logger;
pub mod manager;
mod reporter;
mod table;
mod worker;

pub use self::builder::TaskManagerBuilder;
pub use self::logger::DualLogger;
pub use self::manager::{Cancellation, SubmitOptions, TaskManager};
