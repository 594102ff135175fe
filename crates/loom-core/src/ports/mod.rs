//! Ports - the seams between the task manager and everything around it.
//!
//! Each concern gets one trait; concrete backends are picked once, at the
//! composition root, and handed in by reference.

pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod event_sink;
pub mod id_generator;
pub mod queue_client;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatch::{Delivery, DispatchError, ResultDispatcher};
pub use self::engine::{Engine, EngineError, FnEngine};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_client::{OutboundMessage, QueueClient};
