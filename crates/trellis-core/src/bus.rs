use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;

use crate::lifecycle::{EXECUTED, INITIALIZED, PLUGINS_EXECUTED, PREPARED, READY};

pub type HandlerFn = dyn Fn(&[Value]) -> Result<()> + Send + Sync;

/// Callable subscribed to a signal.
///
/// Identity is the allocation: clones of a handler compare equal, two handlers
/// built from the same closure body do not. Unsubscribing therefore needs the
/// exact handler that was subscribed.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Result<()> {
        (self.0)(args)
    }

    pub fn same(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Publish/subscribe hub a plugin attaches to.
pub trait Coordinator: Send + Sync {
    fn subscribe(&self, signal: &str, handler: Handler);
    fn unsubscribe(&self, signal: &str, handler: &Handler);
    fn publish(&self, signal: &str, args: &[Value]) -> Result<()>;
}

/// In-memory [`Coordinator`]. Serves both as the system-wide bus and as the
/// local observable every plugin exposes for its own lifecycle events.
#[derive(Default)]
pub struct MessageBus {
    subscribers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, signal: &str) -> usize {
        self.subscribers
            .lock()
            .get(signal)
            .map_or(0, |handlers| handlers.len())
    }

    pub fn is_subscribed(&self, signal: &str, handler: &Handler) -> bool {
        self.subscribers
            .lock()
            .get(signal)
            .is_some_and(|handlers| handlers.iter().any(|h| h.same(handler)))
    }
}

impl Coordinator for MessageBus {
    fn subscribe(&self, signal: &str, handler: Handler) {
        let mut subscribers = self.subscribers.lock();
        let handlers = subscribers.entry(signal.to_string()).or_default();
        if !handlers.iter().any(|h| h.same(&handler)) {
            handlers.push(handler);
        }
    }

    fn unsubscribe(&self, signal: &str, handler: &Handler) {
        let mut subscribers = self.subscribers.lock();
        if let Some(handlers) = subscribers.get_mut(signal) {
            handlers.retain(|h| !h.same(handler));
            if handlers.is_empty() {
                subscribers.remove(signal);
            }
        }
    }

    /// Delivers to a snapshot of the current subscribers, skipping any that were
    /// removed by an earlier handler in the same dispatch. Stops at the first
    /// failing handler.
    fn publish(&self, signal: &str, args: &[Value]) -> Result<()> {
        metrics::counter!("trellis_signals_published_total", "signal" => metric_label(signal))
            .increment(1);
        let snapshot = self
            .subscribers
            .lock()
            .get(signal)
            .cloned()
            .unwrap_or_default();
        for handler in snapshot {
            if !self.is_subscribed(signal, &handler) {
                continue;
            }
            handler
                .call(args)
                .with_context(|| format!("handler for signal `{signal}` failed"))?;
        }
        Ok(())
    }
}

/// Metric label for `signal`. Application signals share one bucket so
/// dynamic names cannot grow the label set.
fn metric_label(signal: &str) -> &'static str {
    match signal {
        PREPARED => PREPARED,
        READY => READY,
        PLUGINS_EXECUTED => PLUGINS_EXECUTED,
        INITIALIZED => INITIALIZED,
        EXECUTED => EXECUTED,
        _ => "other",
    }
}

/// The three bus primitives as seen from inside a plugin. Chosen once at
/// construction; an unattached plugin gets silent no-ops.
#[derive(Clone, Default)]
pub enum BusDelegate {
    #[default]
    Unattached,
    Attached(Arc<dyn Coordinator>),
}

impl BusDelegate {
    pub fn from_coordinator(coordinator: Option<Arc<dyn Coordinator>>) -> Self {
        coordinator.map_or(Self::Unattached, Self::Attached)
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached(_))
    }

    pub fn on_system_message(&self, signal: &str, handler: Handler) {
        if let Self::Attached(coordinator) = self {
            coordinator.subscribe(signal, handler);
        }
    }

    pub fn un_system_message(&self, signal: &str, handler: &Handler) {
        if let Self::Attached(coordinator) = self {
            coordinator.unsubscribe(signal, handler);
        }
    }

    pub fn send_system_message(&self, signal: &str, args: &[Value]) -> Result<()> {
        match self {
            Self::Attached(coordinator) => coordinator.publish(signal, args),
            Self::Unattached => Ok(()),
        }
    }
}

impl fmt::Debug for BusDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unattached => f.write_str("Unattached"),
            Self::Attached(_) => f.write_str("Attached"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = counter.clone();
        Handler::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn handler_identity_follows_allocation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = counting(&counter);
        let b = counting(&counter);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn unsubscribe_requires_the_subscribed_handler() {
        let bus = MessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = counting(&counter);
        bus.subscribe("foo", subscribed.clone());

        bus.unsubscribe("foo", &counting(&counter));
        bus.publish("foo", &[]).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        bus.unsubscribe("foo", &subscribed);
        bus.publish("foo", &[]).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("foo"), 0);
    }

    #[test]
    fn handler_removed_mid_dispatch_is_skipped() {
        let bus = Arc::new(MessageBus::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let victim = counting(&counter);
        let remover = {
            let bus = bus.clone();
            let victim = victim.clone();
            Handler::new(move |_| {
                bus.unsubscribe("tick", &victim);
                Ok(())
            })
        };
        bus.subscribe("tick", remover);
        bus.subscribe("tick", victim);

        bus.publish("tick", &[]).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn metric_labels_are_bounded() {
        assert_eq!(metric_label(READY), "ready");
        assert_eq!(metric_label(EXECUTED), "executed");
        assert_eq!(metric_label("tick"), "other");
        assert_eq!(metric_label("user-42-clicked"), "other");
    }

    #[test]
    fn publish_stops_at_first_failure() {
        let bus = MessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe("boom", Handler::new(|_| anyhow::bail!("exploded")));
        bus.subscribe("boom", counting(&counter));

        let err = bus.publish("boom", &[]).unwrap_err();
        assert_eq!(err.root_cause().to_string(), "exploded");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unattached_delegate_is_a_no_op() {
        let delegate = BusDelegate::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting(&counter);
        delegate.on_system_message("foo", handler.clone());
        delegate.un_system_message("foo", &handler);
        delegate.send_system_message("foo", &[]).unwrap();
        assert!(!delegate.is_attached());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attached_delegate_forwards_arguments() {
        let bus = Arc::new(MessageBus::new());
        let delegate = BusDelegate::from_coordinator(Some(bus.clone() as Arc<dyn Coordinator>));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            Handler::new(move |args| {
                seen.lock().extend_from_slice(args);
                Ok(())
            })
        };
        delegate.on_system_message("data", handler);
        delegate
            .send_system_message("data", &[Value::from(1), Value::from("two")])
            .unwrap();
        assert_eq!(*seen.lock(), vec![Value::from(1), Value::from("two")]);
    }
}
