//! Built-in plugin kinds the CLI can run from a config file, plus the
//! document their element selectors resolve against.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use trellis_core::{
    config::Configuration, ArgBinding, Deferred, Node, Plugin, PluginBuilder, PluginContext,
    PluginEntry, PluginSystem, Selector,
};

/// Application signal the timer broadcasts when the system finishes.
pub const TICK: &str = "tick";

pub fn document() -> Node {
    Node::new("body")
        .with_child(Node::new("header").with_id("header"))
        .with_child(
            Node::new("main").with_id("main").with_child(
                Node::new("ul")
                    .with_class("items")
                    .with_child(Node::new("li").with_class("item"))
                    .with_child(Node::new("li").with_class("item"))
                    .with_child(Node::new("li").with_class("item")),
            ),
        )
        .with_child(Node::new("footer"))
}

/// Constructs the plugin described by `entry` and hands it to `system`.
pub fn install(system: &mut PluginSystem, entry: &PluginEntry, document: &Node) -> Result<()> {
    let mut builder = system
        .builder(entry.name.clone())
        .config(entry.configuration()?);
    if let Some(raw) = &entry.element {
        let selector = Selector::parse(raw)?;
        let element = document
            .query(&selector)
            .into_iter()
            .next()
            .with_context(|| format!("no element matches `{raw}` for plugin `{}`", entry.name))?;
        builder = builder.element(element);
    }
    match entry.kind.as_str() {
        "announcer" => adopt(system, builder, Announcer::default()),
        "timer" => adopt(system, builder, Timer::default()),
        "faulty" => adopt(system, builder, Faulty),
        other => bail!("unknown plugin kind `{other}` for plugin `{}`", entry.name),
    }
}

fn adopt<P: Plugin>(system: &mut PluginSystem, builder: PluginBuilder, plugin: P) -> Result<()> {
    let instance = builder.build(plugin)?;
    system.adopt(instance);
    Ok(())
}

/// Logs its element's items on init and every `tick` it hears.
#[derive(Default)]
pub struct Announcer {
    ticks: Arc<AtomicUsize>,
}

impl Plugin for Announcer {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        let items = ctx.child(".item")?.len();
        let name = ctx.name();
        tracing::info!(plugin = %name, items, "announcer initialised");
        let ticks = self.ticks.clone();
        ctx.bind_system_message(
            TICK,
            "announce_tick",
            ArgBinding::Append(vec![Value::from(name.clone())]),
            move |args| {
                ticks.fetch_add(1, Ordering::SeqCst);
                tracing::info!(plugin = %name, ?args, "tick received");
                Ok(())
            },
        )?;
        Ok(())
    }

    fn on_finished(&self, ctx: &PluginContext) -> Result<()> {
        tracing::info!(
            plugin = %ctx.name(),
            ticks = self.ticks.load(Ordering::SeqCst),
            "announcer finished"
        );
        Ok(())
    }
}

/// Completes its execute phase after `interval_ms` on the tokio runtime.
pub struct Timer {
    interval_ms: AtomicU64,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            interval_ms: AtomicU64::new(100),
        }
    }
}

impl Plugin for Timer {
    fn configure(&self, _ctx: &PluginContext, config: &Configuration) -> Result<()> {
        if let Some(value) = config.get("interval_ms") {
            let ms = value
                .as_u64()
                .context("`interval_ms` must be a non-negative integer")?;
            self.interval_ms.store(ms, Ordering::SeqCst);
        }
        Ok(())
    }

    fn execute(&self, ctx: &PluginContext, deferred: Deferred) -> Result<Option<Deferred>> {
        let runtime =
            tokio::runtime::Handle::try_current().context("timer plugin needs a tokio runtime")?;
        let interval = Duration::from_millis(self.interval_ms.load(Ordering::SeqCst));
        tracing::info!(plugin = %ctx.name(), ?interval, "timer started");
        let token = deferred.clone();
        runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            token.resolve();
        });
        Ok(Some(deferred))
    }

    fn on_finished(&self, ctx: &PluginContext) -> Result<()> {
        ctx.send_system_message(TICK, &[Value::from(ctx.name())])
    }
}

/// Fails its init on purpose; the rest of the system carries on.
pub struct Faulty;

impl Plugin for Faulty {
    fn init(&self, ctx: &PluginContext) -> Result<()> {
        let message = ctx
            .config_value("message")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "faulty plugin failed".to_string());
        bail!(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Phase;

    fn entry(name: &str, kind: &str) -> PluginEntry {
        PluginEntry {
            name: name.into(),
            kind: kind.into(),
            ..PluginEntry::default()
        }
    }

    #[tokio::test]
    async fn demo_plugins_reach_finished() {
        let document = document();
        let mut system = PluginSystem::new();
        let mut announcer = entry("announcer", "announcer");
        announcer.element = Some("#main".into());
        let mut timer = entry("clock", "timer");
        timer.config = serde_json::json!({ "interval_ms": 5 });
        for e in [announcer, timer, entry("flaky", "faulty")] {
            install(&mut system, &e, &document).unwrap();
        }

        system.run().await.unwrap();
        assert!(system
            .phases()
            .iter()
            .all(|(_, phase)| *phase == Phase::Finished));
    }

    #[test]
    fn unknown_kind_and_missing_element_are_errors() {
        let document = document();
        let mut system = PluginSystem::new();
        assert!(install(&mut system, &entry("x", "nope"), &document).is_err());

        let mut missing = entry("y", "announcer");
        missing.element = Some("#absent".into());
        assert!(install(&mut system, &missing, &document).is_err());
        assert!(system.is_empty());
    }

    #[test]
    fn timer_rejects_non_numeric_interval() {
        let document = document();
        let mut system = PluginSystem::new();
        let mut timer = entry("clock", "timer");
        timer.config = serde_json::json!({ "interval_ms": "soon" });
        let err = install(&mut system, &timer, &document).unwrap_err();
        assert!(format!("{err:#}").contains("interval_ms"));
    }
}
