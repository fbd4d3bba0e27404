//! Server error types.

use chainwall_config::ConfigError;
use chainwall_core::{ERROR_CONFIG, ERROR_IO};
use chainwall_tunnels::TunnelError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("worker: {0}")]
    Worker(String),
}

impl ServerError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Io(_) | ServerError::Worker(_) => ERROR_IO,
            ServerError::Config(_) => ERROR_CONFIG,
            ServerError::Tunnel(e) => e.error_type(),
        }
    }
}
