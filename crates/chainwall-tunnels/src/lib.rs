//! Built-in chainwall tunnels and the node manager that links them.
//!
//! - [`TcpListenerTunnel`]: accepted TCP sockets, read/write backpressure
//! - [`TlsServerTunnel`]: TLS termination on top of rustls
//! - [`LoggerTunnel`]: debug-level pass-through
//! - [`Layer3Sender`]: hands a chain's traffic to a device chain
//! - [`NodeManager`]: builds chains from node configurations

pub mod error;
pub mod layer3_sender;
pub mod logger;
pub mod node;
pub mod tcp_listener;
pub mod tls;
pub mod tls_server;

pub use error::TunnelError;
pub use layer3_sender::Layer3Sender;
pub use logger::LoggerTunnel;
pub use node::{Acceptor, Factory, Instance, NodeManager};
pub use tcp_listener::{ListenerStats, TcpListenerTunnel};
pub use tls::load_tls_config;
pub use tls_server::{TlsServerTunnel, TlsStats};
