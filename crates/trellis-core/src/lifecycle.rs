//! Lifecycle signal names, phases and fail-open hook invocation.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::anyhow;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{bus::Handler, log::PluginLogger};

/// Published by the coordinator, in this order.
pub const PREPARED: &str = "prepared";
pub const READY: &str = "ready";
pub const PLUGINS_EXECUTED: &str = "pluginsexecuted";

/// Published by each plugin on its own local event bus.
pub const INITIALIZED: &str = "initialized";
pub const EXECUTED: &str = "executed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Constructed,
    Prepared,
    Executed,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Constructed => "constructed",
            Phase::Prepared => "prepared",
            Phase::Executed => "executed",
            Phase::Finished => "finished",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    Prepared,
    Ready,
    PluginsExecuted,
}

impl LifecycleSignal {
    pub const ALL: [LifecycleSignal; 3] = [
        LifecycleSignal::Prepared,
        LifecycleSignal::Ready,
        LifecycleSignal::PluginsExecuted,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LifecycleSignal::Prepared => PREPARED,
            LifecycleSignal::Ready => READY,
            LifecycleSignal::PluginsExecuted => PLUGINS_EXECUTED,
        }
    }
}

/// Overridable hooks whose failures are isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Init,
    Execute,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::Init => "init",
            Hook::Execute => "execute",
        }
    }
}

/// Tagged result of an isolated hook call.
#[derive(Debug)]
pub enum HookOutcome<T> {
    Completed(T),
    Failed(anyhow::Error),
}

impl<T> HookOutcome<T> {
    /// Runs `hook`, turning both `Err` and panics into [`HookOutcome::Failed`].
    pub fn capture<F>(hook: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        match catch_unwind(AssertUnwindSafe(hook)) {
            Ok(Ok(value)) => HookOutcome::Completed(value),
            Ok(Err(err)) => HookOutcome::Failed(err),
            Err(payload) => HookOutcome::Failed(anyhow!("panicked: {}", panic_message(&*payload))),
        }
    }

    /// Logs a failure against `plugin` and discards it.
    pub fn or_log(self, plugin: &str, hook: Hook, logger: &dyn PluginLogger) -> Option<T> {
        match self {
            HookOutcome::Completed(value) => Some(value),
            HookOutcome::Failed(err) => {
                logger.error(&format!("error in {plugin}.{}(): {err:#}", hook.name()));
                metrics::counter!("trellis_hook_failures_total", "hook" => hook.name())
                    .increment(1);
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Once-flags for each lifecycle step plus the live subscriptions to the
/// coordinator's lifecycle signals.
#[derive(Default)]
pub(crate) struct LifecycleState {
    prepared: AtomicBool,
    ready: AtomicBool,
    executed: AtomicBool,
    finished: AtomicBool,
    subscriptions: Mutex<HashMap<LifecycleSignal, Handler>>,
}

impl LifecycleState {
    /// True exactly once per signal.
    pub(crate) fn enter(&self, signal: LifecycleSignal) -> bool {
        let flag = match signal {
            LifecycleSignal::Prepared => &self.prepared,
            LifecycleSignal::Ready => &self.ready,
            LifecycleSignal::PluginsExecuted => &self.finished,
        };
        !flag.swap(true, Ordering::AcqRel)
    }

    /// True exactly once; guards the `executed` publication.
    pub(crate) fn mark_executed(&self) -> bool {
        !self.executed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn phase(&self) -> Phase {
        if self.finished.load(Ordering::Acquire) {
            Phase::Finished
        } else if self.executed.load(Ordering::Acquire) {
            Phase::Executed
        } else if self.prepared.load(Ordering::Acquire) {
            Phase::Prepared
        } else {
            Phase::Constructed
        }
    }

    pub(crate) fn track(&self, signal: LifecycleSignal, handler: Handler) {
        self.subscriptions.lock().insert(signal, handler);
    }

    pub(crate) fn untrack(&self, signal: LifecycleSignal) -> Option<Handler> {
        self.subscriptions.lock().remove(&signal)
    }

    pub(crate) fn untrack_all(&self) -> Vec<(LifecycleSignal, Handler)> {
        self.subscriptions.lock().drain().collect()
    }

    pub(crate) fn tracked(&self) -> usize {
        self.subscriptions.lock().len()
    }
}
