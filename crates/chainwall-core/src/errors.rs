//! Error type constants for metrics and logging.
//!
//! These constants provide consistent error classification across all crates.

/// TLS handshake error.
pub const ERROR_TLS_HANDSHAKE: &str = "tls_handshake";
/// TLS record (encrypt/decrypt) error after the handshake completed.
pub const ERROR_TLS_RECORD: &str = "tls_record";
/// I/O error.
pub const ERROR_IO: &str = "io";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Chain wiring error (double link, unknown node, cycle).
pub const ERROR_CHAIN: &str = "chain";

/// Errors raised while wiring tunnels into a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("tunnel `{0}` is already linked into a chain")]
    AlreadyLinked(&'static str),
    #[error("chain is empty")]
    Empty,
}

impl ChainError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        ERROR_CHAIN
    }
}
