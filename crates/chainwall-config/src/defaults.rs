//! Default value functions for serde deserialization.
//!
//! These functions forward to constants defined in `chainwall_core::defaults`.

use chainwall_core::defaults;

/// Generate default value functions that forward to chainwall_core::defaults constants.
macro_rules! default_fns {
    // For Copy types (integers, bool, etc.)
    ($($fn_name:ident => $const_name:ident : $ty:ty),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> $ty {
                defaults::$const_name
            }
        )*
    };
}

/// Generate default value functions that return String from &str constants.
macro_rules! default_string_fns {
    ($($fn_name:ident => $const_name:ident),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> String {
                defaults::$const_name.to_string()
            }
        )*
    };
}

default_fns! {
    default_workers               => DEFAULT_WORKERS: usize,
    default_buffer_size           => DEFAULT_BUFFER_SIZE: usize,
    default_pool_max_free         => DEFAULT_POOL_MAX_FREE: usize,
    default_shutdown_timeout_secs => DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64,
    default_connection_backlog    => DEFAULT_CONNECTION_BACKLOG: u32,
    default_tcp_no_delay          => DEFAULT_TCP_NO_DELAY: bool,
    default_upstream_preview      => DEFAULT_LOGGER_UPSTREAM_PREVIEW: usize,
    default_downstream_preview    => DEFAULT_LOGGER_DOWNSTREAM_PREVIEW: usize,
}

default_string_fns! {
    default_min_tls_version => DEFAULT_TLS_MIN_VERSION,
    default_max_tls_version => DEFAULT_TLS_MAX_VERSION,
}
