//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Worker Defaults
// ============================================================================

/// Default number of worker threads (0 = one per available CPU).
pub const DEFAULT_WORKERS: usize = 0;
/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Buffer/Size Defaults
// ============================================================================

/// Default pooled buffer capacity. Also the size of one socket read.
pub const DEFAULT_BUFFER_SIZE: usize = 4080;
/// Default maximum number of idle buffers a worker keeps for reuse.
pub const DEFAULT_POOL_MAX_FREE: usize = 1024;
/// Capacity reserved for a decrypted TLS plaintext batch before growth.
pub const DEFAULT_TLS_PLAINTEXT_CHUNK: usize = 8192;

// ============================================================================
// TCP Socket Defaults
// ============================================================================

/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;
/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Payload length treated as a synthetic disconnect when the
/// `disconnect-sentinel` listener option is enabled.
pub const DISCONNECT_SENTINEL_LEN: usize = 10;

// ============================================================================
// TLS Defaults
// ============================================================================

/// Default minimum TLS version.
pub const DEFAULT_TLS_MIN_VERSION: &str = "tls12";
/// Default maximum TLS version.
pub const DEFAULT_TLS_MAX_VERSION: &str = "tls13";

// ============================================================================
// Logger Tunnel Defaults
// ============================================================================

/// Bytes of upstream payload shown by the logger tunnel.
pub const DEFAULT_LOGGER_UPSTREAM_PREVIEW: usize = 200;
/// Bytes of downstream payload shown by the logger tunnel.
pub const DEFAULT_LOGGER_DOWNSTREAM_PREVIEW: usize = 20;
