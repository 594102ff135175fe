//! TracingSink - forwards lifecycle events to `tracing`.
//!
//! Each channel gets its own target, so a subscriber's `EnvFilter` can set
//! the service and debug levels independently:
//! `loom::service=info,loom::debug=off`.

use crate::domain::{Channel, LogEvent, LogLevel};
use crate::ports::EventSink;

pub const SERVICE_TARGET: &str = "loom::service";
pub const DEBUG_TARGET: &str = "loom::debug";

// `tracing` needs the target and level as constants at each callsite.
macro_rules! forward {
    ($target:expr, $level:expr, $event:ident) => {
        tracing::event!(
            target: $target,
            $level,
            task_id = %$event.task,
            fields = %$event.fields,
            timestamp = %$event.timestamp,
            "{}",
            $event.message
        )
    };
}

/// Event fields pre-rendered for the `tracing` macros.
struct Rendered<'a> {
    task: String,
    fields: serde_json::Value,
    timestamp: String,
    message: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LogEvent) {
        use tracing::Level;

        let r = Rendered {
            task: event.task_id.map(|id| id.to_string()).unwrap_or_default(),
            fields: serde_json::Value::Object(event.fields.clone()),
            timestamp: event.timestamp.to_rfc3339(),
            message: &event.message,
        };

        match (event.channel, event.level) {
            (Channel::Service, LogLevel::Debug) => {
                forward!(SERVICE_TARGET, Level::DEBUG, r)
            }
            (Channel::Service, LogLevel::Info) => {
                forward!(SERVICE_TARGET, Level::INFO, r)
            }
            (Channel::Service, LogLevel::Warn) => {
                forward!(SERVICE_TARGET, Level::WARN, r)
            }
            (Channel::Service, LogLevel::Error) => {
                forward!(SERVICE_TARGET, Level::ERROR, r)
            }
            (Channel::Debug, LogLevel::Debug) => {
                forward!(DEBUG_TARGET, Level::DEBUG, r)
            }
            (Channel::Debug, LogLevel::Info) => {
                forward!(DEBUG_TARGET, Level::INFO, r)
            }
            (Channel::Debug, LogLevel::Warn) => {
                forward!(DEBUG_TARGET, Level::WARN, r)
            }
            (Channel::Debug, LogLevel::Error) => {
                forward!(DEBUG_TARGET, Level::ERROR, r)
            }
        }
    }
}
