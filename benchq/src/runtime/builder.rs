use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use super::controller::RunController;
use crate::config::OrchestratorConfig;
use crate::events::RunEventBus;
use crate::store::{InMemoryRunStore, RunStore};

/// Builder for a [`RunController`] with explicit dependencies.
///
/// The configuration is validated and the store is required; the event bus
/// defaults to a private one sized by `controller.event_capacity`.
///
/// # Example
///
/// ```ignore
/// let controller = RunControllerBuilder::new(config)
///     .with_store(Arc::new(InMemoryRunStore::new()))
///     .with_events(Arc::new(RunEventBus::new(1024)))
///     .build()?;
/// ```
pub struct RunControllerBuilder<S>
where
    S: RunStore + 'static,
{
    config: OrchestratorConfig,
    store: Option<Arc<S>>,
    events: Option<Arc<RunEventBus>>,
}

impl<S> fmt::Debug for RunControllerBuilder<S>
where
    S: RunStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunControllerBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("events_set", &self.events.is_some());
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        debug.finish()
    }
}

impl<S> RunControllerBuilder<S>
where
    S: RunStore + 'static,
{
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            events: None,
        }
    }

    /// Set the run store.
    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: Arc<RunEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is missing or the configuration is
    /// invalid.
    pub fn build(self) -> anyhow::Result<RunController<S>> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let events = self.events.unwrap_or_else(|| {
            Arc::new(RunEventBus::new(self.config.controller.event_capacity))
        });

        Ok(RunController::with_events(self.config, store, events))
    }
}

impl RunController<InMemoryRunStore> {
    /// Controller over a fresh [`InMemoryRunStore`].
    pub fn in_memory(config: OrchestratorConfig) -> anyhow::Result<Self> {
        RunControllerBuilder::new(config)
            .with_store(Arc::new(InMemoryRunStore::new()))
            .build()
    }
}
