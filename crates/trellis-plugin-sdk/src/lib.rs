pub mod discovery;
pub mod manifest;

pub use discovery::discover_manifests;
pub use manifest::PluginManifest;

pub use semver::Version;
