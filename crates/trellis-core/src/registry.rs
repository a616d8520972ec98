//! Bookkeeping for bus subscriptions a plugin makes through its binding
//! helpers, so they can all be torn down without the caller keeping the
//! handlers around.

use std::{borrow::Cow, collections::BTreeMap};

use serde_json::Value;

use crate::{
    bus::Handler,
    error::{PluginError, Result},
};

/// How extra arguments captured at bind time combine with the arguments a
/// signal is published with.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ArgBinding {
    #[default]
    PassThrough,
    /// Call-time arguments are dropped in favour of the bound ones.
    Replace(Vec<Value>),
    /// Bound arguments follow the call-time ones.
    Append(Vec<Value>),
}

impl ArgBinding {
    pub fn apply<'a>(&'a self, args: &'a [Value]) -> Cow<'a, [Value]> {
        match self {
            ArgBinding::PassThrough => Cow::Borrowed(args),
            ArgBinding::Replace(extra) => Cow::Borrowed(extra.as_slice()),
            ArgBinding::Append(extra) if extra.is_empty() => Cow::Borrowed(args),
            ArgBinding::Append(extra) => {
                let mut joined = Vec::with_capacity(args.len() + extra.len());
                joined.extend_from_slice(args);
                joined.extend_from_slice(extra);
                Cow::Owned(joined)
            }
        }
    }
}

/// Which registrations an unbind call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unbind<'a> {
    All,
    Signal(&'a str),
    Binding { signal: &'a str, key: &'a str },
}

/// signal -> binding key -> the handler that was actually subscribed.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, BTreeMap<String, Handler>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(signal: &str, key: &str) -> Result<()> {
        if signal.trim().is_empty() {
            return Err(PluginError::invalid_binding(
                signal,
                key,
                "signal name must not be empty",
            ));
        }
        if key.trim().is_empty() {
            return Err(PluginError::invalid_binding(
                signal,
                key,
                "binding key must not be empty",
            ));
        }
        Ok(())
    }

    /// Stores `handler` under `(signal, key)` and hands back whatever it
    /// replaced; the caller is responsible for unsubscribing that one.
    pub fn insert(&mut self, signal: &str, key: &str, handler: Handler) -> Option<Handler> {
        self.entries
            .entry(signal.to_string())
            .or_default()
            .insert(key.to_string(), handler)
    }

    /// Drops the targeted registrations and returns them so they can be
    /// unsubscribed once the registry lock is released.
    pub fn remove(&mut self, scope: Unbind<'_>) -> Result<Vec<(String, Handler)>> {
        match scope {
            Unbind::All => Ok(std::mem::take(&mut self.entries)
                .into_iter()
                .flat_map(|(signal, bindings)| {
                    bindings
                        .into_values()
                        .map(move |handler| (signal.clone(), handler))
                })
                .collect()),
            Unbind::Signal(signal) => Ok(self
                .entries
                .remove(signal)
                .map(|bindings| {
                    bindings
                        .into_values()
                        .map(|handler| (signal.to_string(), handler))
                        .collect()
                })
                .unwrap_or_default()),
            Unbind::Binding { signal, key } => {
                let bindings = self
                    .entries
                    .get_mut(signal)
                    .ok_or_else(|| PluginError::not_bound(signal, key))?;
                let handler = bindings
                    .remove(key)
                    .ok_or_else(|| PluginError::not_bound(signal, key))?;
                if bindings.is_empty() {
                    self.entries.remove(signal);
                }
                Ok(vec![(signal.to_string(), handler)])
            }
        }
    }

    pub fn get(&self, signal: &str, key: &str) -> Option<&Handler> {
        self.entries.get(signal)?.get(key)
    }

    pub fn contains(&self, signal: &str, key: &str) -> bool {
        self.get(signal, key).is_some()
    }

    pub fn signals(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
