//! # chainwall
//!
//! Composable tunnel chains: independent protocol units linked into a
//! pipeline that every connection's data and lifecycle events traverse.
//!
//! ## Crates
//!
//! - [`chainwall_core`] - Buffers, lines, contexts and the tunnel contract
//! - [`chainwall_config`] - Configuration loading and validation
//! - [`chainwall_metrics`] - Prometheus-compatible metrics
//! - [`chainwall_tunnels`] - Built-in tunnels and the node manager
//! - [`chainwall_server`] - Socket dispatch, workers and CLI

pub use chainwall_config as config;
pub use chainwall_core as core;
pub use chainwall_metrics as metrics;
pub use chainwall_server as server;
pub use chainwall_tunnels as tunnels;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use chainwall_config::{Config, load_config, validate_config};
    pub use chainwall_core::{Context, Line, Tunnel, Worker};
    pub use chainwall_server::{CancellationToken, ServerError, run, run_with_shutdown};
    pub use chainwall_tunnels::NodeManager;
}
