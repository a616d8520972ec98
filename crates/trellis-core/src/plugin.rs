use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{
    bus::{BusDelegate, Coordinator, Handler, MessageBus},
    config::{kind_of, Configuration},
    deferred::{Deferred, Outcome},
    element::{Element, ElementBinder},
    error::{PluginError, Result},
    lifecycle::{
        Hook, HookOutcome, LifecycleSignal, LifecycleState, Phase, EXECUTED, INITIALIZED,
    },
    log::{LoggerProvider, PluginLogger, TracingLoggerProvider},
    registry::{ArgBinding, SubscriptionRegistry, Unbind},
};

/// Override points of a plugin. Every hook has a default, so a plugin only
/// implements the phases it cares about.
pub trait Plugin: Send + Sync + 'static {
    /// Validates plugin specific settings before they are merged into the
    /// context. Runs during construction and on every `reconfigure`.
    fn configure(&self, _ctx: &PluginContext, _config: &Configuration) -> anyhow::Result<()> {
        Ok(())
    }

    fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returning `Ok(None)` completes the phase immediately. Returning a token
    /// (usually `deferred` itself) completes it once that token settles.
    fn execute(&self, _ctx: &PluginContext, deferred: Deferred) -> anyhow::Result<Option<Deferred>> {
        deferred.resolve();
        Ok(Some(deferred))
    }

    fn on_finished(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// State shared by every plugin regardless of its concrete type; this is
/// what hooks get to work with.
pub struct PluginContext {
    name: RwLock<String>,
    element: ElementBinder,
    config: RwLock<Configuration>,
    registry: Mutex<SubscriptionRegistry>,
    delegate: BusDelegate,
    events: MessageBus,
    logger: Arc<dyn PluginLogger>,
    destroyed: AtomicBool,
}

impl PluginContext {
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn element(&self) -> Option<&Arc<dyn Element>> {
        self.element.element()
    }

    pub fn child(&self, selector: &str) -> Result<Vec<Arc<dyn Element>>> {
        self.element.child(selector)
    }

    pub fn config(&self) -> Configuration {
        self.config.read().clone()
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config.read().get(key).cloned()
    }

    pub fn logger(&self) -> &dyn PluginLogger {
        self.logger.as_ref()
    }

    /// Local observable carrying this plugin's `initialized` / `executed`.
    pub fn events(&self) -> &MessageBus {
        &self.events
    }

    pub fn is_attached(&self) -> bool {
        self.delegate.is_attached()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn on_system_message(&self, signal: &str, handler: Handler) {
        if !self.is_destroyed() {
            self.delegate.on_system_message(signal, handler);
        }
    }

    pub fn un_system_message(&self, signal: &str, handler: &Handler) {
        if !self.is_destroyed() {
            self.delegate.un_system_message(signal, handler);
        }
    }

    pub fn send_system_message(&self, signal: &str, args: &[Value]) -> anyhow::Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.delegate.send_system_message(signal, args)
    }

    /// Subscribes `handler` to `signal` and tracks it under `key` so it can
    /// be released with [`PluginContext::unbind_system_message`] or
    /// `destroy` without holding on to it.
    pub fn bind_system_message<F>(
        &self,
        signal: &str,
        key: &str,
        args: ArgBinding,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        SubscriptionRegistry::validate(signal, key)?;
        let bound = Handler::new(move |call_args| handler(&*args.apply(call_args)));
        self.install(signal, key, bound)
    }

    pub fn unbind_system_message(&self, scope: Unbind<'_>) -> Result<usize> {
        let removed = self.registry.lock().remove(scope)?;
        for (signal, handler) in &removed {
            self.delegate.un_system_message(signal, handler);
        }
        tracing::debug!(plugin = %self.name(), ?scope, released = removed.len(), "unbound system messages");
        Ok(removed.len())
    }

    pub fn is_bound(&self, signal: &str, key: &str) -> bool {
        self.registry.lock().contains(signal, key)
    }

    pub fn bound_handler(&self, signal: &str, key: &str) -> Option<Handler> {
        self.registry.lock().get(signal, key).cloned()
    }

    pub fn binding_count(&self) -> usize {
        self.registry.lock().len()
    }

    fn install(&self, signal: &str, key: &str, handler: Handler) -> Result<()> {
        if self.is_destroyed() {
            return Err(PluginError::Destroyed { name: self.name() });
        }
        let replaced = self.registry.lock().insert(signal, key, handler.clone());
        if let Some(previous) = replaced {
            tracing::debug!(plugin = %self.name(), signal, key, "replacing existing binding");
            self.delegate.un_system_message(signal, &previous);
        }
        self.delegate.on_system_message(signal, handler);
        Ok(())
    }

    fn publish_local(&self, signal: &str) {
        if let Err(err) = self.events.publish(signal, &[]) {
            tracing::warn!(plugin = %self.name(), signal, error = %err, "local listener failed");
        }
    }

    fn teardown(&self, lifecycle: &LifecycleState) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let removed = self
            .registry
            .lock()
            .remove(Unbind::All)
            .unwrap_or_default();
        for (signal, handler) in &removed {
            self.delegate.un_system_message(signal, handler);
        }
        for (signal, handler) in lifecycle.untrack_all() {
            self.delegate.un_system_message(signal.name(), &handler);
        }
        tracing::debug!(plugin = %self.name(), released = removed.len(), "plugin destroyed");
        true
    }
}

/// Construction parameters; everything but the name is optional.
pub struct PluginBuilder {
    name: String,
    config: Configuration,
    element: Option<Arc<dyn Element>>,
    coordinator: Option<Arc<dyn Coordinator>>,
    logger_provider: Arc<dyn LoggerProvider>,
}

impl PluginBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Configuration::new(),
            element: None,
            coordinator: None,
            logger_provider: Arc::new(TracingLoggerProvider),
        }
    }

    pub fn config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn element(mut self, element: Arc<dyn Element>) -> Self {
        self.element = Some(element);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn logger_provider(mut self, provider: Arc<dyn LoggerProvider>) -> Self {
        self.logger_provider = provider;
        self
    }

    /// Wires element, then the bus delegate and lifecycle subscriptions, then
    /// applies the configuration. A configuration error tears the instance
    /// down again before it is returned.
    pub fn build<P: Plugin>(self, plugin: P) -> Result<PluginInstance<P>> {
        let element = ElementBinder::new(self.element);
        let delegate = BusDelegate::from_coordinator(self.coordinator);
        let logger = self.logger_provider.logger(&self.name);
        let ctx = PluginContext {
            name: RwLock::new(self.name),
            element,
            config: RwLock::new(Configuration::new()),
            registry: Mutex::new(SubscriptionRegistry::new()),
            delegate,
            events: MessageBus::new(),
            logger,
            destroyed: AtomicBool::new(false),
        };
        let instance = PluginInstance {
            shared: Arc::new(Shared {
                ctx,
                lifecycle: LifecycleState::default(),
                plugin,
            }),
        };
        instance.subscribe_lifecycle();
        if let Err(err) = instance.reconfigure(self.config) {
            instance.destroy();
            return Err(err);
        }
        Ok(instance)
    }
}

struct Shared<P: Plugin> {
    ctx: PluginContext,
    lifecycle: LifecycleState,
    plugin: P,
}

impl<P: Plugin> Shared<P> {
    fn release(&self, signal: LifecycleSignal) {
        if let Some(handler) = self.lifecycle.untrack(signal) {
            self.ctx.delegate.un_system_message(signal.name(), &handler);
        }
    }

    fn complete_execute(&self, outcome: &Outcome) {
        if let Outcome::Rejected(reason) = outcome {
            HookOutcome::<()>::Failed(anyhow::anyhow!("completion rejected: {reason}")).or_log(
                &self.ctx.name(),
                Hook::Execute,
                self.ctx.logger(),
            );
        }
        if self.ctx.is_destroyed() || !self.lifecycle.mark_executed() {
            return;
        }
        self.ctx.publish_local(EXECUTED);
    }
}

impl<P: Plugin> Drop for Shared<P> {
    fn drop(&mut self) {
        self.ctx.teardown(&self.lifecycle);
    }
}

/// A constructed plugin: its context, its lifecycle controller and the
/// concrete [`Plugin`]. Cloning yields another handle to the same instance.
pub struct PluginInstance<P: Plugin> {
    shared: Arc<Shared<P>>,
}

impl<P: Plugin> Clone for PluginInstance<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: Plugin> PluginInstance<P> {
    pub fn name(&self) -> String {
        self.shared.ctx.name()
    }

    pub fn context(&self) -> &PluginContext {
        &self.shared.ctx
    }

    pub fn plugin(&self) -> &P {
        &self.shared.plugin
    }

    pub fn phase(&self) -> Phase {
        self.shared.lifecycle.phase()
    }

    pub fn events(&self) -> &MessageBus {
        self.shared.ctx.events()
    }

    /// Number of coordinator lifecycle signals this instance still listens to.
    pub fn lifecycle_subscriptions(&self) -> usize {
        self.shared.lifecycle.tracked()
    }

    fn subscribe_lifecycle(&self) {
        if !self.shared.ctx.delegate.is_attached() {
            return;
        }
        for signal in LifecycleSignal::ALL {
            let weak = Arc::downgrade(&self.shared);
            let handler = Handler::new(move |_| {
                let Some(instance) = PluginInstance::upgrade(&weak) else {
                    return Ok(());
                };
                match signal {
                    LifecycleSignal::Prepared => instance.on_prepared(),
                    LifecycleSignal::Ready => instance.on_ready(),
                    LifecycleSignal::PluginsExecuted => return instance.on_plugins_executed(),
                }
                Ok(())
            });
            self.shared.lifecycle.track(signal, handler.clone());
            self.shared.ctx.delegate.on_system_message(signal.name(), handler);
        }
    }

    fn upgrade(weak: &Weak<Shared<P>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Handles `prepared`: runs `init` once, isolating its failure, then
    /// publishes `initialized` locally either way.
    pub fn on_prepared(&self) {
        let shared = &self.shared;
        if shared.ctx.is_destroyed() || !shared.lifecycle.enter(LifecycleSignal::Prepared) {
            return;
        }
        shared.release(LifecycleSignal::Prepared);
        HookOutcome::capture(|| shared.plugin.init(&shared.ctx)).or_log(
            &shared.ctx.name(),
            Hook::Init,
            shared.ctx.logger(),
        );
        shared.ctx.publish_local(INITIALIZED);
    }

    /// Handles `ready`: runs `execute` once and publishes `executed` when the
    /// phase completes. A failing `execute` is logged and its token settled.
    pub fn on_ready(&self) {
        let shared = &self.shared;
        if shared.ctx.is_destroyed() || !shared.lifecycle.enter(LifecycleSignal::Ready) {
            return;
        }
        shared.release(LifecycleSignal::Ready);
        let deferred = Deferred::new();
        let returned = HookOutcome::capture(|| shared.plugin.execute(&shared.ctx, deferred.clone()))
            .or_log(&shared.ctx.name(), Hook::Execute, shared.ctx.logger());
        let token = match returned {
            Some(None) => {
                shared.complete_execute(&Outcome::Resolved);
                return;
            }
            Some(Some(token)) => token,
            None => {
                deferred.resolve();
                deferred
            }
        };
        let weak = Arc::downgrade(shared);
        token.on_settled(move |outcome| {
            if let Some(shared) = weak.upgrade() {
                shared.complete_execute(outcome);
            }
        });
    }

    /// Handles `pluginsexecuted`. Failures from `on_finished` are returned to
    /// the caller.
    pub fn on_plugins_executed(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        if shared.ctx.is_destroyed() || !shared.lifecycle.enter(LifecycleSignal::PluginsExecuted)
        {
            return Ok(());
        }
        shared.release(LifecycleSignal::PluginsExecuted);
        shared
            .plugin
            .on_finished(&shared.ctx)
            .with_context(|| format!("error in {}.on_finished()", shared.ctx.name()))
    }

    /// Binds one of the plugin's own methods to `signal`, pinned to this
    /// instance. `key` identifies the binding for later unbinding.
    pub fn bind_method<M>(&self, signal: &str, key: &str, args: ArgBinding, method: M) -> Result<()>
    where
        M: Fn(&P, &PluginContext, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .ctx
            .bind_system_message(signal, key, args, move |call_args| match weak.upgrade() {
                Some(shared) => method(&shared.plugin, &shared.ctx, call_args),
                None => Ok(()),
            })
    }

    pub fn bind_system_message<F>(
        &self,
        signal: &str,
        key: &str,
        args: ArgBinding,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.ctx.bind_system_message(signal, key, args, handler)
    }

    pub fn unbind_system_message(&self, scope: Unbind<'_>) -> Result<usize> {
        self.shared.ctx.unbind_system_message(scope)
    }

    pub fn child(&self, selector: &str) -> Result<Vec<Arc<dyn Element>>> {
        self.shared.ctx.child(selector)
    }

    /// Validates `config` with [`Plugin::configure`] and merges it into the
    /// stored configuration. A string `name` entry renames the plugin.
    pub fn reconfigure(&self, config: Configuration) -> Result<()> {
        let ctx = &self.shared.ctx;
        if ctx.is_destroyed() {
            return Err(PluginError::Destroyed { name: ctx.name() });
        }
        let rename = match config.get("name") {
            None => None,
            Some(Value::String(name)) if !name.trim().is_empty() => Some(name.clone()),
            Some(other) => {
                return Err(PluginError::InvalidConfiguration(format!(
                    "`name` must be a non-empty string, found {}",
                    kind_of(other)
                )))
            }
        };
        self.shared
            .plugin
            .configure(ctx, &config)
            .map_err(|err| PluginError::InvalidConfiguration(format!("{err:#}")))?;
        if let Some(name) = rename {
            *ctx.name.write() = name;
        }
        ctx.config.write().extend(config);
        Ok(())
    }

    /// Releases every binding and lifecycle subscription. Terminal: later
    /// signals and manual lifecycle calls are ignored.
    pub fn destroy(&self) {
        self.shared.ctx.teardown(&self.shared.lifecycle);
    }
}
