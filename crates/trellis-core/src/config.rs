use std::{collections::HashSet, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::element::Selector;

/// Opaque key/value settings applied to a plugin through `reconfigure`.
pub type Configuration = serde_json::Map<String, Value>;

/// Root host configuration deserialized from TOML/JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    pub system: SystemSettings,
    pub plugins: Vec<PluginEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub name: String,
    /// Upper bound on how long a host waits for every plugin to execute.
    pub execute_timeout_secs: Option<u64>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            name: "trellis".into(),
            execute_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginEntry {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    /// Selector resolved against the host document to pick the plugin element.
    pub element: Option<String>,
    pub config: Value,
}

impl Default for PluginEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            enabled: true,
            element: None,
            config: Value::Null,
        }
    }
}

impl SystemConfig {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_plugins().next().is_none() {
            bail!("at least one enabled plugin is required");
        }
        let mut names = HashSet::new();
        for entry in &self.plugins {
            entry.validate()?;
            if !names.insert(entry.name.as_str()) {
                bail!("duplicate plugin name `{}`", entry.name);
            }
        }
        Ok(())
    }

    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginEntry> {
        self.plugins.iter().filter(|entry| entry.enabled)
    }

    pub fn execute_timeout(&self) -> Option<Duration> {
        self.system.execute_timeout_secs.map(Duration::from_secs)
    }
}

impl PluginEntry {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("plugin name must not be empty");
        }
        if self.kind.trim().is_empty() {
            bail!("plugin `{}` must declare a kind", self.name);
        }
        if let Some(selector) = &self.element {
            Selector::parse(selector)
                .with_context(|| format!("invalid element selector for plugin `{}`", self.name))?;
        }
        self.configuration()?;
        Ok(())
    }

    /// The entry's `config` table as a plugin [`Configuration`].
    pub fn configuration(&self) -> Result<Configuration> {
        match &self.config {
            Value::Null => Ok(Configuration::new()),
            Value::Object(map) => Ok(map.clone()),
            other => bail!(
                "config for plugin `{}` must be a table, found {}",
                self.name,
                kind_of(other)
            ),
        }
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
