use common::{Kind, ResourceKey};
use thiserror::Error;

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while turning a changed resource into routes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("{kind} key '{key}' has no namespace")]
    MissingNamespace { kind: Kind, key: ResourceKey },
}

/// Invalid process configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: invalid value '{value}'")]
    InvalidValue { name: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Tunnel daemon failures, fed into a link's repair loop
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("failed to launch tunnel daemon: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tunnel daemon exited: {0}")]
    Exited(String),

    #[error("tunnel daemon panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
