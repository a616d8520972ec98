use std::sync::Arc;

use parking_lot::Mutex;

/// Sink a plugin reports isolated hook failures to.
pub trait PluginLogger: Send + Sync {
    fn error(&self, message: &str);
}

/// Hands out one logger per component name; asked once per plugin at
/// construction.
pub trait LoggerProvider: Send + Sync {
    fn logger(&self, component: &str) -> Arc<dyn PluginLogger>;
}

/// Default provider, forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLoggerProvider;

impl LoggerProvider for TracingLoggerProvider {
    fn logger(&self, component: &str) -> Arc<dyn PluginLogger> {
        Arc::new(TracingLogger {
            component: component.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TracingLogger {
    component: String,
}

impl PluginLogger for TracingLogger {
    fn error(&self, message: &str) {
        tracing::error!(component = %self.component, "{message}");
    }
}

/// Keeps every line in memory. Handy for hosts that surface plugin errors in
/// their own UI, and for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl PluginLogger for MemoryLogger {
    fn error(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }
}

/// All components share the same [`MemoryLogger`].
impl LoggerProvider for MemoryLogger {
    fn logger(&self, component: &str) -> Arc<dyn PluginLogger> {
        tracing::debug!(component, "memory logger handed out");
        Arc::new(self.clone())
    }
}
