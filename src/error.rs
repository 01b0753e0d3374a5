//! Error types.

use crate::types::{ConnectionId, Dimension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// No probing mechanism is enabled for the target server.
    #[error("no probing mechanism is enabled for this server")]
    Unsupported,
    #[error("no scheduler registered for dimension {0}")]
    NoScheduler(Dimension),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection {0} has shut down")]
    ConnectionClosed(ConnectionId),
    #[error("unknown classification policy '{0}'")]
    UnknownPolicy(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
