//! Tunnel construction error types.

use chainwall_config::ConfigError;
use chainwall_core::{ChainError, ERROR_CHAIN, ERROR_CONFIG, ERROR_IO, ERROR_TLS_HANDSHAKE};

/// Errors raised while turning node configurations into chains.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Settings(#[from] ConfigError),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{name}': unknown tunnel type '{node_type}'")]
    UnknownType { name: String, node_type: String },
    #[error("node '{0}' is referenced while it is being built")]
    Cycle(String),
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
}

impl TunnelError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            TunnelError::Io(_) => ERROR_IO,
            TunnelError::Tls(_) => ERROR_TLS_HANDSHAKE,
            TunnelError::Config(_)
            | TunnelError::Settings(_)
            | TunnelError::UnknownNode(_)
            | TunnelError::UnknownType { .. } => ERROR_CONFIG,
            TunnelError::Cycle(_) | TunnelError::Chain(_) => ERROR_CHAIN,
        }
    }
}
