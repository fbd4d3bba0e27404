//! Core pipeline model shared across chainwall crates.
//!
//! This crate provides:
//! - [`Buffer`] and the per-worker [`BufferPool`]
//! - [`Line`] (one connection and its per-tunnel state table) and
//!   [`Context`] (one event travelling along a chain)
//! - The [`Tunnel`] contract and [`ChainBuilder`]
//! - [`Worker`], the explicit per-thread handle passed to every tunnel call
//! - Default configuration values and error classification constants

pub mod buffer;
pub mod context;
pub mod defaults;
pub mod errors;
pub mod filter;
pub mod io;
pub mod line;
pub mod tunnel;
pub mod worker;

// Re-export commonly used items at crate root
pub use buffer::{Buffer, BufferPool};
pub use context::{Context, Kind};
pub use defaults::*;
pub use errors::*;
pub use filter::{SocketFilter, SocketProtocol};
pub use io::IoHandle;
pub use line::{Line, LineStage};
pub use tunnel::{
    ApiResult, Chain, ChainBuilder, InboundHandler, Links, Tunnel, terminate_downstream,
    terminate_upstream,
};
pub use worker::{Worker, WorkerStats};

/// Project name.
pub const PROJECT_NAME: &str = "chainwall";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
