//! loom-core
//!
//! Bounded task queue with a fixed pool of engine workers.
//!
//! # Modules
//! - **domain**: ids, task record and status machine, log events
//! - **ports**: seams (Engine, Clock, IdGenerator, EventSink, ResultDispatcher, QueueClient)
//! - **impls**: in-process backends for the ports, plus their factories
//! - **queue**: the bounded FIFO and the retry policy
//! - **app**: task table, worker pool, task manager, builder
//! - **config**: environment-driven configuration
//! - **error**: error taxonomy
//! - **observability**: queue statistics

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{Cancellation, DualLogger, SubmitOptions, TaskManager, TaskManagerBuilder};
pub use config::AppConfig;
pub use domain::{TaskId, TaskMode, TaskSnapshot, TaskStatus};
pub use error::{BuildError, ConfigError, TaskError};
pub use observability::{QueueStats, StatusCounts};
pub use ports::{Engine, EngineError, FnEngine};
