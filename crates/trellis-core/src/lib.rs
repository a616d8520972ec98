pub mod bus;
pub mod config;
pub mod deferred;
pub mod element;
pub mod error;
pub mod lifecycle;
pub mod log;
pub mod plugin;
pub mod registry;
pub mod system;

pub use bus::{BusDelegate, Coordinator, Handler, MessageBus};
pub use config::{Configuration, PluginEntry, SystemConfig};
pub use deferred::{Deferred, Outcome};
pub use element::{Element, ElementBinder, Node, Selector};
pub use error::{PluginError, Result};
pub use lifecycle::Phase;
pub use plugin::{Plugin, PluginBuilder, PluginContext, PluginInstance};
pub use registry::{ArgBinding, Unbind};
pub use system::PluginSystem;

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
