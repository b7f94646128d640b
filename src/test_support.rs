//! Test utilities shared across the crate.
//!
//! This module is only compiled during tests (`#[cfg(test)]`).

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use crate::core::plugin::{CoreEvent, DynInputPlugin, InputPlugin, RawContext};
use crate::core::config::ResolvedConfig;
use crate::core::registry::{PluginId, Registry};
use crate::core::section::Section;

/// Drives a single input plugin without a core loop: the test decides when
/// mailbox messages are delivered.
pub struct PluginHarness {
    pub registry: Registry,
    tx: UnboundedSender<CoreEvent>,
    rx: UnboundedReceiver<CoreEvent>,
    tasks: Vec<AbortHandle>,
}

impl PluginHarness {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            registry: Registry::new(),
            tx,
            rx,
            tasks: Vec::new(),
        }
    }

    pub fn raw(&mut self) -> RawContext<'_> {
        RawContext {
            plugin: PluginId(0),
            generation: 1,
            registry: &mut self.registry,
            tx: &self.tx,
            tasks: &mut self.tasks,
        }
    }

    pub fn init<P, F>(&mut self, config: &ResolvedConfig, init: F) -> Result<P, crate::core::PluginInitError>
    where
        P: InputPlugin,
        F: FnOnce(
            &ResolvedConfig,
            &mut crate::core::PluginContext<'_, P::Message>,
        ) -> Result<P, crate::core::PluginInitError>,
    {
        init(config, &mut self.raw().typed())
    }

    /// Waits for the next mailbox message and hands it to `plugin`.
    pub async fn pump(&mut self, plugin: &mut dyn DynInputPlugin) {
        match self.rx.recv().await {
            Some(CoreEvent::Plugin { message, .. }) => plugin.deliver(message, self.raw()),
            other => panic!("expected a plugin message, got {other:?}"),
        }
    }

    pub fn section(&self, name: &str, instance: &str) -> Option<&Section> {
        self.registry
            .find_by_identity(name, instance)
            .map(|(_, section)| section)
    }

    pub fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
