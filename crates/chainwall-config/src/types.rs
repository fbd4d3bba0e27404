//! Configuration type definitions for the core runtime, nodes, metrics and logging.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::defaults::*;
use crate::loader::ConfigError;

/// Process-wide runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CoreConfig {
    /// Worker threads. 0 = one per available CPU.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of a pooled buffer and size of one socket read.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle buffers each worker keeps for reuse.
    #[serde(default = "default_pool_max_free")]
    pub pool_max_free: usize,
    /// How long live connections may drain after a shutdown signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// TCP listener backlog (pending connections queue size).
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            pool_max_free: default_pool_max_free(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            connection_backlog: default_connection_backlog(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus exporter listen address. Disabled when unset.
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Option<String>,
    /// Log format: json, pretty, or compact. Default: pretty.
    pub format: Option<String>,
    /// Output target: stdout or stderr. Default: stderr.
    pub output: Option<String>,
    /// Per-module log level filters (e.g., {"chainwall_tunnels": "debug", "rustls": "warn"}).
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Directory for log files. Console output only when unset.
    pub directory: Option<String>,
    /// Core log file name inside `directory`. Default: core.log.
    pub core_file: Option<String>,
    /// Network (tunnel) log file name inside `directory`. Default: network.log.
    pub network_file: Option<String>,
}

/// One named tunnel instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Tunnel type, e.g. `TcpListener`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific settings, parsed by the tunnel.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Name of the node chained above this one.
    #[serde(default)]
    pub next: Option<String>,
}

impl NodeConfig {
    /// Parse this node's settings as `T`. Missing settings parse like `{}`.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let value = match &self.settings {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| {
            ConfigError::Validation(format!("{}({}).settings: {}", self.node_type, self.name, e))
        })
    }
}

/// Listening port: a single number or an inclusive `[min, max]` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Single(u16),
    Range(Vec<u16>),
}

impl PortSpec {
    /// `(min, max)`, or `None` when the port setting is malformed.
    pub fn bounds(&self) -> Option<(u16, u16)> {
        match self {
            PortSpec::Single(0) => None,
            PortSpec::Single(p) => Some((*p, *p)),
            PortSpec::Range(r) => match r.as_slice() {
                [min, max] if *min != 0 && min <= max => Some((*min, *max)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TcpListenerSettings {
    pub address: String,
    pub port: PortSpec,
    #[serde(default = "default_tcp_no_delay")]
    pub nodelay: bool,
    /// Allowed peer networks (CIDR). Empty allows everyone.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Rejected peer networks (CIDR).
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Treat an incoming read of exactly 10 bytes as a peer disconnect.
    #[serde(default)]
    pub disconnect_sentinel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TlsServerSettings {
    /// Server certificate chain (PEM).
    pub cert_file: String,
    /// Server private key (PEM, PKCS#8, PKCS#1 or SEC1).
    pub key_file: String,
    /// ALPN protocols in server preference order. Empty selects the
    /// client's first offer.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Minimum TLS version (tls12, tls13). Default: tls12
    #[serde(default = "default_min_tls_version")]
    pub min_version: String,
    /// Maximum TLS version (tls12, tls13). Default: tls13
    #[serde(default = "default_max_tls_version")]
    pub max_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggerSettings {
    #[serde(default = "default_upstream_preview")]
    pub upstream_preview: usize,
    #[serde(default = "default_downstream_preview")]
    pub downstream_preview: usize,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            upstream_preview: default_upstream_preview(),
            downstream_preview: default_downstream_preview(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Layer3SenderSettings {
    /// Name of the node heading the device chain packets are injected into.
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str, settings: serde_json::Value) -> NodeConfig {
        NodeConfig {
            name: "n".into(),
            node_type: node_type.into(),
            settings,
            next: None,
        }
    }

    #[test]
    fn core_config_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.workers, 0);
        assert_eq!(cfg.buffer_size, 4080);
        assert_eq!(cfg.pool_max_free, 1024);
        assert_eq!(cfg.shutdown_timeout_secs, 30);
    }

    #[test]
    fn core_config_uses_kebab_case() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"workers": 2, "buffer-size": 8192}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.buffer_size, 8192);
        assert_eq!(cfg.pool_max_free, 1024);
    }

    #[test]
    fn port_spec_single_and_range() {
        let single: PortSpec = serde_json::from_str("443").unwrap();
        assert_eq!(single.bounds(), Some((443, 443)));
        let range: PortSpec = serde_json::from_str("[8000, 8010]").unwrap();
        assert_eq!(range.bounds(), Some((8000, 8010)));
    }

    #[test]
    fn port_spec_rejects_malformed_ranges() {
        assert_eq!(PortSpec::Single(0).bounds(), None);
        assert_eq!(PortSpec::Range(vec![9000, 8000]).bounds(), None);
        assert_eq!(PortSpec::Range(vec![1, 2, 3]).bounds(), None);
        assert_eq!(PortSpec::Range(vec![0, 10]).bounds(), None);
    }

    #[test]
    fn tcp_listener_settings_defaults() {
        let n = node(
            "TcpListener",
            serde_json::json!({"address": "0.0.0.0", "port": 443}),
        );
        let s: TcpListenerSettings = n.settings().unwrap();
        assert!(s.nodelay);
        assert!(!s.disconnect_sentinel);
        assert!(s.whitelist.is_empty());
    }

    #[test]
    fn tls_settings_kebab_case() {
        let n = node(
            "TlsServer",
            serde_json::json!({"cert-file": "c.pem", "key-file": "k.pem", "alpn": ["h2"]}),
        );
        let s: TlsServerSettings = n.settings().unwrap();
        assert_eq!(s.cert_file, "c.pem");
        assert_eq!(s.min_version, "tls12");
        assert_eq!(s.max_version, "tls13");
        assert_eq!(s.alpn, vec!["h2"]);
    }

    #[test]
    fn missing_settings_parse_as_empty_object() {
        let s: LoggerSettings = node("Logger", serde_json::Value::Null).settings().unwrap();
        assert_eq!(s.upstream_preview, 200);
        assert_eq!(s.downstream_preview, 20);
    }

    #[test]
    fn settings_error_names_the_node() {
        let err = node("Layer3Sender", serde_json::json!({}))
            .settings::<Layer3SenderSettings>()
            .unwrap_err();
        assert!(err.to_string().contains("Layer3Sender(n)"));
    }
}
