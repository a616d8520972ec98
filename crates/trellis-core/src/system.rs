//! Reference coordinator driver: owns the system bus and walks every
//! adopted plugin through `prepared`, `ready` and `pluginsexecuted`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::{
    bus::{Coordinator, Handler, MessageBus},
    deferred::Deferred,
    lifecycle::{Phase, EXECUTED, PLUGINS_EXECUTED, PREPARED, READY},
    log::LoggerProvider,
    plugin::{Plugin, PluginBuilder, PluginInstance},
};

/// Type-erased view of a plugin instance held by the system.
pub trait ManagedPlugin: Send + Sync {
    fn name(&self) -> String;
    fn phase(&self) -> Phase;
    fn events(&self) -> &MessageBus;
    fn destroy(&self);
}

impl<P: Plugin> ManagedPlugin for PluginInstance<P> {
    fn name(&self) -> String {
        PluginInstance::name(self)
    }

    fn phase(&self) -> Phase {
        PluginInstance::phase(self)
    }

    fn events(&self) -> &MessageBus {
        PluginInstance::events(self)
    }

    fn destroy(&self) {
        PluginInstance::destroy(self)
    }
}

struct Member {
    plugin: Arc<dyn ManagedPlugin>,
    executed: Deferred,
}

pub struct PluginSystem {
    bus: Arc<MessageBus>,
    members: Vec<Member>,
    logger_provider: Option<Arc<dyn LoggerProvider>>,
}

impl Default for PluginSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginSystem {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(MessageBus::new()),
            members: Vec::new(),
            logger_provider: None,
        }
    }

    pub fn with_logger_provider(mut self, provider: Arc<dyn LoggerProvider>) -> Self {
        self.logger_provider = Some(provider);
        self
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Builder already wired to this system's bus and logger provider.
    pub fn builder(&self, name: impl Into<String>) -> PluginBuilder {
        let builder = PluginBuilder::new(name).coordinator(self.bus.clone());
        match &self.logger_provider {
            Some(provider) => builder.logger_provider(provider.clone()),
            None => builder,
        }
    }

    /// Starts tracking `instance`'s local `executed` event.
    pub fn adopt<P: Plugin>(&mut self, instance: PluginInstance<P>) -> PluginInstance<P> {
        let executed = Deferred::new();
        let token = executed.clone();
        instance.events().subscribe(
            EXECUTED,
            Handler::new(move |_| {
                token.resolve();
                Ok(())
            }),
        );
        tracing::debug!(plugin = %instance.name(), "plugin adopted");
        self.members.push(Member {
            plugin: Arc::new(instance.clone()),
            executed,
        });
        instance
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn phases(&self) -> Vec<(String, Phase)> {
        self.members
            .iter()
            .map(|member| (member.plugin.name(), member.plugin.phase()))
            .collect()
    }

    /// Names of adopted plugins that have not published `executed` yet.
    pub fn pending(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|member| member.executed.is_pending())
            .map(|member| member.plugin.name())
            .collect()
    }

    pub fn prepare(&self) -> Result<()> {
        tracing::info!(plugins = self.members.len(), "broadcasting prepared");
        self.bus
            .publish(PREPARED, &[])
            .context("prepared broadcast failed")
    }

    pub fn ready(&self) -> Result<()> {
        tracing::info!(plugins = self.members.len(), "broadcasting ready");
        self.bus.publish(READY, &[]).context("ready broadcast failed")
    }

    /// Settles once every adopted plugin has published `executed`.
    pub fn all_executed(&self) -> Deferred {
        Deferred::all(self.members.iter().map(|member| member.executed.clone()))
    }

    pub fn finish(&self) -> Result<()> {
        tracing::info!(plugins = self.members.len(), "broadcasting pluginsexecuted");
        self.bus
            .publish(PLUGINS_EXECUTED, &[])
            .context("pluginsexecuted broadcast failed")
    }

    /// Full lifecycle: `prepared`, `ready`, wait for every plugin to execute,
    /// then `pluginsexecuted`. A plugin whose token rejected still counts as
    /// executed; the rejection is reported through its logger.
    pub async fn run(&self) -> Result<()> {
        self.prepare()?;
        self.ready()?;
        self.all_executed().await;
        self.finish()
    }

    /// Application-level broadcast on the system bus.
    pub fn broadcast(&self, signal: &str, args: &[Value]) -> Result<()> {
        self.bus.publish(signal, args)
    }

    pub fn shutdown(&mut self) {
        for member in self.members.drain(..) {
            member.plugin.destroy();
        }
        tracing::info!("plugin system shut down");
    }
}
