//! Configuration loading and CLI definitions.
//!
//! A configuration file carries process-wide `core`, `logging` and `metrics`
//! sections plus a flat list of named `nodes`. Each node names its tunnel
//! type, type-specific `settings`, and optionally the `next` node chained
//! above it. A node that no other node names as `next` heads a chain.

mod cli;
mod defaults;
mod loader;
mod types;
mod validate;

use serde::{Deserialize, Serialize};

pub use cli::{CliOverrides, apply_overrides};
pub use loader::{ConfigError, ConfigFormat, load_config, parse_config};
pub use types::*;
pub use validate::validate_config;

/// Built-in tunnel type names.
pub mod node_types {
    pub const TCP_LISTENER: &str = "TcpListener";
    pub const TLS_SERVER: &str = "TlsServer";
    pub const LOGGER: &str = "Logger";
    pub const LAYER3_SENDER: &str = "Layer3Sender";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub nodes: Vec<NodeConfig>,
}

impl Config {
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Whether some node chains `name` above itself.
    pub fn is_referenced_as_next(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.next.as_deref() == Some(name))
    }

    /// Nodes that head a chain, in file order.
    pub fn chain_heads(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| !self.is_referenced_as_next(&n.name))
    }

    /// The nodes of the chain headed by `head`, edge first.
    ///
    /// Stops at a dangling `next` or when a node repeats.
    pub fn chain_from<'a>(&'a self, head: &'a NodeConfig) -> Vec<&'a NodeConfig> {
        let mut chain = vec![head];
        let mut cursor = head;
        while let Some(next) = cursor.next.as_deref().and_then(|n| self.node(n)) {
            if chain.iter().any(|seen| seen.name == next.name) {
                break;
            }
            chain.push(next);
            cursor = next;
        }
        chain
    }
}
