//! Impls - concrete backends for the ports.
//!
//! Backends are chosen once by the factories below; call sites only ever
//! see the port traits.

pub mod dispatch;
pub mod queue_client;
pub mod recording_sink;
pub mod tracing_sink;

use std::sync::Arc;

pub use self::dispatch::QueueDispatcher;
pub use self::queue_client::{InMemoryQueueClient, NullQueueClient};
pub use self::recording_sink::{NoopSink, RecordingSink};
pub use self::tracing_sink::{DEBUG_TARGET, SERVICE_TARGET, TracingSink};

use crate::app::DualLogger;
use crate::config::{DispatchConfig, LoggingConfig, MqBackend};
use crate::ports::{QueueClient, ResultDispatcher};

/// Build the queue client for the configured backend.
pub fn queue_client_for(backend: MqBackend) -> Arc<dyn QueueClient> {
    match backend {
        MqBackend::None => Arc::new(NullQueueClient),
        MqBackend::Memory => Arc::new(InMemoryQueueClient::new()),
    }
}

/// Build the result dispatcher publishing through `client`.
pub fn dispatcher_for(
    config: &DispatchConfig,
    client: Arc<dyn QueueClient>,
) -> Arc<dyn ResultDispatcher> {
    Arc::new(QueueDispatcher::new(client, config.topic.clone()))
}

/// Both channels go to `tracing`; a disabled debug channel is dropped at
/// the source instead of at the filter.
pub fn logger_from_config(config: &LoggingConfig) -> DualLogger {
    let debug: Arc<dyn crate::ports::EventSink> = if config.debug_enabled {
        Arc::new(TracingSink)
    } else {
        Arc::new(NoopSink)
    };
    DualLogger::new(Arc::new(TracingSink), debug)
}
