use anyhow::{Context, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// On-disk JSON manifest located next to each plugin artifact.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub kind: Option<String>,
    pub capabilities: Vec<String>,
    /// System signals the plugin binds handlers to beyond the lifecycle ones.
    pub signals: Vec<String>,
    /// Semver requirement on the host, e.g. `>=0.1, <0.3`.
    pub host: Option<String>,
}

impl PluginManifest {
    pub fn requires_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    pub fn listens_to(&self, signal: &str) -> bool {
        self.signals.iter().any(|s| s == signal)
    }

    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.version)
            .with_context(|| format!("plugin `{}` has invalid version `{}`", self.name, self.version))
    }

    /// A manifest without a `host` requirement is compatible with any host.
    pub fn supports_host(&self, host: &Version) -> Result<bool> {
        let Some(raw) = &self.host else {
            return Ok(true);
        };
        let req = VersionReq::parse(raw)
            .with_context(|| format!("plugin `{}` has invalid host requirement `{raw}`", self.name))?;
        Ok(req.matches(host))
    }
}
