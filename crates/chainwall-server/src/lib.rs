//! chainwall server library.
//!
//! Binds the sockets registered by acceptor tunnels, hands accepted
//! connections to worker threads and exposes the `run`/`check` CLI used by
//! the `chainwall` binary.

pub mod cli;
mod error;
mod limits;
mod server;
mod util;
mod worker;

pub use error::ServerError;
pub use server::{run, run_with_shutdown};
pub use tokio_util::sync::CancellationToken;
pub use util::create_listener;
pub use worker::WorkerPool;
