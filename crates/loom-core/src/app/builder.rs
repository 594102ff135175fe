//! TaskManagerBuilder - wiring and start-up validation.
//!
//! Fail-fast: a missing engine or an invalid configuration is reported by
//! `build()`, never discovered by the first task.

use std::sync::Arc;

use super::logger::DualLogger;
use super::manager::{Parts, TaskManager};
use super::reporter::LifecycleReporter;
use super::table::TaskTable;
use crate::config::{AppConfig, ManagerConfig};
use crate::error::BuildError;
use crate::impls::{TracingSink, dispatcher_for, logger_from_config, queue_client_for};
use crate::ports::{
    Clock, Engine, IdGenerator, QueueClient, ResultDispatcher, SystemClock, UlidGenerator,
};

/// # Example
/// ```ignore
/// let manager = TaskManagerBuilder::new(config.manager.clone())
///     .engine(FnEngine::arc(|payload| async move { Ok(payload.as_ref().clone()) }))
///     .build()?;
/// manager.start()?;
/// ```
pub struct TaskManagerBuilder {
    config: ManagerConfig,
    engine: Option<Arc<dyn Engine>>,
    logger: Option<DualLogger>,
    dispatcher: Option<Arc<dyn ResultDispatcher>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl TaskManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            engine: None,
            logger: None,
            dispatcher: None,
            clock: None,
            ids: None,
        }
    }

    /// Manager settings, both log channels, and result delivery through the
    /// configured message-queue backend.
    ///
    /// With `MQ_TYPE=memory` nothing outside the manager can read the
    /// buffered deliveries; use [`Self::from_config_with_client`] to keep a
    /// handle on the client.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_config_with_client(config, queue_client_for(config.dispatch.backend))
    }

    /// Like [`Self::from_config`], but results are published through
    /// `client`, which the caller owns and drains.
    pub fn from_config_with_client(config: &AppConfig, client: Arc<dyn QueueClient>) -> Self {
        Self::new(config.manager.clone())
            .logger(logger_from_config(&config.logging))
            .dispatcher(dispatcher_for(&config.dispatch, client))
    }

    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn logger(mut self, logger: DualLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Receives every finished ASYNC task. Without one, ASYNC results are
    /// only available through `get_status`.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ResultDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<TaskManager, BuildError> {
        let engine = self.engine.ok_or(BuildError::MissingEngine)?;
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let logger = self
            .logger
            .unwrap_or_else(|| DualLogger::shared(Arc::new(TracingSink)))
            .with_clock(Arc::clone(&clock));

        let table = Arc::new(TaskTable::new(Arc::clone(&clock)));
        let reporter = Arc::new(LifecycleReporter::new(
            logger,
            self.dispatcher,
            Arc::clone(&table),
        ));

        Ok(TaskManager::from_parts(Parts {
            config: self.config,
            table,
            engine,
            reporter,
            ids,
            clock,
        }))
    }
}
