mod demo;

use std::{fs, path::PathBuf, sync::OnceLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};
use trellis_core::{PluginSystem, SystemConfig};
use trellis_plugin_sdk::{discover_manifests, PluginManifest, Version};

const DEFAULT_CONFIG: &str = "crates/trellis-cli/config/minimal.trellis.toml";

#[derive(Parser, Debug)]
#[command(name = "trellis", author, version, about = "Plugin lifecycle host")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Construct every configured plugin and drive it through its lifecycle.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Interact with configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugin manifests.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled minimal example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists manifests found in a directory and whether they accept this host.
    List {
        #[arg(long, value_name = "DIR", default_value = "plugins")]
        dir: PathBuf,
        /// Only show manifests declaring this capability.
        #[arg(long, value_name = "NAME")]
        capability: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run { config } => handle_run(config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let document = demo::document();
    let mut system = PluginSystem::new();
    for entry in config.enabled_plugins() {
        demo::install(&mut system, entry, &document)
            .with_context(|| format!("failed to construct plugin `{}`", entry.name))?;
    }
    tracing::info!(
        system = %config.system.name,
        plugins = system.len(),
        "plugin system starting"
    );

    let outcome = match config.execute_timeout() {
        Some(limit) => match tokio::time::timeout(limit, system.run()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "plugins still executing after {limit:?}: {}",
                system.pending().join(", ")
            )),
        },
        None => system.run().await,
    };

    for (name, phase) in system.phases() {
        println!("{name}: {phase}");
    }
    system.shutdown();
    outcome
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../config/minimal.trellis.toml"));
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir, capability } => {
            let host = semver_host()?;
            let manifests = discover_manifests(&dir)?;
            let shown: Vec<_> = manifests
                .iter()
                .filter(|m| capability.as_deref().map_or(true, |cap| m.requires_capability(cap)))
                .collect();
            if shown.is_empty() {
                println!("no plugin manifests found under {}", dir.display());
            }
            for manifest in shown {
                println!("{}", describe_manifest(manifest, &host));
            }
        }
    }
    Ok(())
}

fn describe_manifest(manifest: &PluginManifest, host: &Version) -> String {
    let mut line = format!("- {} v{}", manifest.name, manifest.version);
    if manifest.parsed_version().is_err() {
        line.push_str(" [invalid version]");
    }
    if let Some(kind) = &manifest.kind {
        line.push_str(&format!(" ({kind})"));
    }
    if let Some(description) = &manifest.description {
        line.push_str(&format!(": {description}"));
    }
    if !manifest.capabilities.is_empty() {
        line.push_str(&format!(" caps=[{}]", manifest.capabilities.join(", ")));
    }
    if !manifest.signals.is_empty() {
        line.push_str(&format!(" signals=[{}]", manifest.signals.join(", ")));
    }
    match manifest.supports_host(host) {
        Ok(true) => {}
        Ok(false) => line.push_str(" [incompatible host]"),
        Err(_) => line.push_str(" [invalid host requirement]"),
    }
    line
}

fn semver_host() -> Result<Version> {
    Version::parse(trellis_core::version())
        .context("host version is not valid semver")
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<SystemConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<SystemConfig>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = match RE.get() {
        Some(regex) => regex,
        None => {
            let compiled = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}")?;
            RE.get_or_init(|| compiled)
        }
    };
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_falls_back_to_default() {
        let out = interpolate_env("ms = ${TRELLIS_TEST_UNSET_VAR:250}").unwrap();
        assert_eq!(out, "ms = 250");
    }

    #[test]
    fn bundled_example_parses_and_validates() {
        let raw = interpolate_env(include_str!("../config/minimal.trellis.toml")).unwrap();
        let cfg: SystemConfig = toml::from_str(&raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.enabled_plugins().count(), 2);
    }

    #[test]
    fn manifest_line_flags_problems() {
        let host = Version::new(0, 1, 0);
        let manifest = PluginManifest {
            name: "clock".into(),
            version: "one".into(),
            kind: Some("timer".into()),
            capabilities: vec!["timer".into(), "network".into()],
            signals: vec!["tick".into()],
            host: Some("^9".into()),
            ..PluginManifest::default()
        };
        assert_eq!(
            describe_manifest(&manifest, &host),
            "- clock vone [invalid version] (timer) caps=[timer, network] signals=[tick] [incompatible host]"
        );
    }
}
