//! DualLogger - the two lifecycle logging channels.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domain::{Channel, LogEvent, LogLevel, TaskId};
use crate::ports::{Clock, EventSink, SystemClock};

/// Service channel: one line per submission and per outcome.
/// Debug channel: every transition and internal decision.
///
/// Each channel has its own sink, so either can be silenced or redirected
/// without touching the other.
#[derive(Clone)]
pub struct DualLogger {
    service: Arc<dyn EventSink>,
    debug: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl DualLogger {
    pub fn new(service: Arc<dyn EventSink>, debug: Arc<dyn EventSink>) -> Self {
        Self {
            service,
            debug,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Both channels into one sink.
    pub fn shared(sink: Arc<dyn EventSink>) -> Self {
        Self::new(Arc::clone(&sink), sink)
    }

    pub fn service(&self, level: LogLevel, message: &str, task_id: Option<TaskId>, fields: Value) {
        self.emit(Channel::Service, level, message, task_id, fields);
    }

    pub fn debug(&self, level: LogLevel, message: &str, task_id: Option<TaskId>, fields: Value) {
        self.emit(Channel::Debug, level, message, task_id, fields);
    }

    fn emit(
        &self,
        channel: Channel,
        level: LogLevel,
        message: &str,
        task_id: Option<TaskId>,
        fields: Value,
    ) {
        let fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let event = LogEvent {
            channel,
            level,
            message: message.to_string(),
            fields,
            timestamp: self.clock.now(),
            task_id,
        };
        match channel {
            Channel::Service => self.service.emit(&event),
            Channel::Debug => self.debug.emit(&event),
        }
    }
}
