use std::{fs, path::Path};

use anyhow::{Context, Result};

use crate::manifest::PluginManifest;

/// Reads every `*.json` manifest directly under `dir`, sorted by name. A
/// missing directory yields no manifests.
pub fn discover_manifests(dir: &Path) -> Result<Vec<PluginManifest>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: PluginManifest = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        manifests.push(manifest);
    }
    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(manifests)
}
