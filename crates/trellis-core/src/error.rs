use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors surfaced by the plugin base itself. Hook failures are plain
/// `anyhow::Error`s and never show up here unless they are configuration
/// failures.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("cannot bind `{key}` to signal `{signal}`: {reason}")]
    InvalidBinding {
        signal: String,
        key: String,
        reason: String,
    },

    #[error("`{key}` is not bound to signal `{signal}`")]
    NotBound { signal: String, key: String },

    #[error("invalid selector `{0}`")]
    InvalidSelector(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("plugin `{name}` has been destroyed")]
    Destroyed { name: String },
}

impl PluginError {
    pub(crate) fn invalid_binding(signal: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidBinding {
            signal: signal.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_bound(signal: &str, key: &str) -> Self {
        Self::NotBound {
            signal: signal.to_string(),
            key: key.to_string(),
        }
    }
}
