//! Configuration validation logic.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::loader::ConfigError;
use crate::node_types::{LAYER3_SENDER, LOGGER, TCP_LISTENER, TLS_SERVER};
use crate::{
    Config, Layer3SenderSettings, LoggerSettings, NodeConfig, TcpListenerSettings,
    TlsServerSettings,
};

const VALID_TLS_VERSIONS: [&str; 2] = ["tls12", "tls13"];

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.core.buffer_size < 1024 {
        return Err(ConfigError::Validation(
            "core.buffer-size must be >= 1024".into(),
        ));
    }
    if config.core.buffer_size > 1024 * 1024 {
        return Err(ConfigError::Validation(
            "core.buffer-size must be <= 1MB".into(),
        ));
    }
    if config.core.connection_backlog == 0 {
        return Err(ConfigError::Validation(
            "core.connection-backlog must be > 0".into(),
        ));
    }
    if let Some(format) = &config.logging.format
        && !["json", "pretty", "compact"].contains(&format.as_str())
    {
        return Err(ConfigError::Validation(
            "logging.format must be one of: json, pretty, compact".into(),
        ));
    }
    if let Some(output) = &config.logging.output
        && output != "stdout"
        && output != "stderr"
    {
        return Err(ConfigError::Validation(
            "logging.output must be 'stdout' or 'stderr'".into(),
        ));
    }
    if config.nodes.is_empty() {
        return Err(ConfigError::Validation("nodes is empty".into()));
    }

    let mut names = HashSet::new();
    for node in &config.nodes {
        if node.name.trim().is_empty() {
            return Err(ConfigError::Validation("node name is empty".into()));
        }
        if !names.insert(node.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
    }

    for node in &config.nodes {
        if let Some(next) = &node.next {
            if next == &node.name {
                return Err(ConfigError::Validation(format!(
                    "node '{}' names itself as next",
                    node.name
                )));
            }
            if config.node(next).is_none() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': next node '{}' does not exist",
                    node.name, next
                )));
            }
        }
        validate_node(config, node)?;
    }

    check_next_cycles(config)?;
    check_device_cycles(config)
}

fn validate_node(config: &Config, node: &NodeConfig) -> Result<(), ConfigError> {
    match node.node_type.as_str() {
        TCP_LISTENER => {
            let s: TcpListenerSettings = node.settings()?;
            if s.address.parse::<IpAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': address '{}' is not an IP address",
                    node.name, s.address
                )));
            }
            if s.port.bounds().is_none() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': port must be 1..=65535 or a [min, max] range",
                    node.name
                )));
            }
            for net in s.whitelist.iter().chain(&s.blacklist) {
                if net.parse::<IpNet>().is_err() {
                    return Err(ConfigError::Validation(format!(
                        "node '{}': '{}' is not a CIDR network",
                        node.name, net
                    )));
                }
            }
        }
        TLS_SERVER => {
            let s: TlsServerSettings = node.settings()?;
            if s.cert_file.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': cert-file is empty",
                    node.name
                )));
            }
            if s.key_file.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': key-file is empty",
                    node.name
                )));
            }
            let min = version_ord(&s.min_version).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "node '{}': min-version must be one of: {:?}",
                    node.name, VALID_TLS_VERSIONS
                ))
            })?;
            let max = version_ord(&s.max_version).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "node '{}': max-version must be one of: {:?}",
                    node.name, VALID_TLS_VERSIONS
                ))
            })?;
            if min > max {
                return Err(ConfigError::Validation(format!(
                    "node '{}': min-version cannot be greater than max-version",
                    node.name
                )));
            }
        }
        LAYER3_SENDER => {
            let s: Layer3SenderSettings = node.settings()?;
            if s.device == node.name {
                return Err(ConfigError::Validation(format!(
                    "node '{}' names itself as device",
                    node.name
                )));
            }
            if config.node(&s.device).is_none() {
                return Err(ConfigError::Validation(format!(
                    "node '{}': device node '{}' does not exist",
                    node.name, s.device
                )));
            }
            if config.is_referenced_as_next(&s.device) {
                return Err(ConfigError::Validation(format!(
                    "node '{}': device node '{}' must head its own chain",
                    node.name, s.device
                )));
            }
        }
        LOGGER => {
            node.settings::<LoggerSettings>()?;
        }
        // Custom tunnel types validate their own settings when built.
        _ => {}
    }
    Ok(())
}

fn version_ord(v: &str) -> Option<usize> {
    VALID_TLS_VERSIONS.iter().position(|known| *known == v)
}

fn check_next_cycles(config: &Config) -> Result<(), ConfigError> {
    for start in &config.nodes {
        let mut seen = HashSet::new();
        let mut cursor = Some(start);
        while let Some(node) = cursor {
            if !seen.insert(node.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "node '{}' is part of a next cycle",
                    start.name
                )));
            }
            cursor = node.next.as_deref().and_then(|n| config.node(n));
        }
    }
    Ok(())
}

/// A device reference instantiates the referenced chain while the
/// referencing chain is built, so device references between chains must
/// form a DAG.
fn check_device_cycles(config: &Config) -> Result<(), ConfigError> {
    fn devices_of<'a>(config: &'a Config, head: &'a NodeConfig) -> Vec<&'a str> {
        config
            .chain_from(head)
            .into_iter()
            .filter(|n| n.node_type == LAYER3_SENDER)
            .filter_map(|n| n.settings.get("device").and_then(|d| d.as_str()))
            .collect()
    }

    fn visit<'a>(
        config: &'a Config,
        head: &'a NodeConfig,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), ConfigError> {
        if done.contains(head.name.as_str()) {
            return Ok(());
        }
        if path.contains(&head.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "device references form a cycle through '{}'",
                head.name
            )));
        }
        path.push(&head.name);
        for device in devices_of(config, head) {
            if let Some(next_head) = config.node(device) {
                visit(config, next_head, path, done)?;
            }
        }
        path.pop();
        done.insert(&head.name);
        Ok(())
    }

    let mut done = HashSet::new();
    for head in config.chain_heads() {
        visit(config, head, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(nodes: serde_json::Value) -> Config {
        serde_json::from_value(json!({ "nodes": nodes })).unwrap()
    }

    fn err(cfg: &Config) -> String {
        validate_config(cfg).unwrap_err().to_string()
    }

    #[test]
    fn minimal_chain_is_valid() {
        let cfg = config(json!([
            {"name": "in", "type": "TcpListener", "settings": {"address": "0.0.0.0", "port": 443}, "next": "log"},
            {"name": "log", "type": "Logger"}
        ]));
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn empty_nodes_rejected() {
        assert!(err(&config(json!([]))).contains("nodes is empty"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let cfg = config(json!([
            {"name": "a", "type": "Logger"},
            {"name": "a", "type": "Logger"}
        ]));
        assert!(err(&cfg).contains("duplicate node name"));
    }

    #[test]
    fn dangling_next_rejected() {
        let cfg = config(json!([{"name": "a", "type": "Logger", "next": "missing"}]));
        assert!(err(&cfg).contains("does not exist"));
    }

    #[test]
    fn next_cycle_rejected() {
        let cfg = config(json!([
            {"name": "a", "type": "Logger", "next": "b"},
            {"name": "b", "type": "Logger", "next": "a"}
        ]));
        assert!(err(&cfg).contains("cycle"));
    }

    #[test]
    fn bad_port_rejected() {
        let cfg = config(json!([
            {"name": "in", "type": "TcpListener", "settings": {"address": "0.0.0.0", "port": [9000, 8000]}}
        ]));
        assert!(err(&cfg).contains("port"));
    }

    #[test]
    fn bad_address_and_cidr_rejected() {
        let cfg = config(json!([
            {"name": "in", "type": "TcpListener", "settings": {"address": "localhost", "port": 1}}
        ]));
        assert!(err(&cfg).contains("not an IP address"));
        let cfg = config(json!([
            {"name": "in", "type": "TcpListener",
             "settings": {"address": "0.0.0.0", "port": 1, "whitelist": ["10.0.0.0/33"]}}
        ]));
        assert!(err(&cfg).contains("CIDR"));
    }

    #[test]
    fn tls_versions_checked() {
        let cfg = config(json!([
            {"name": "tls", "type": "TlsServer",
             "settings": {"cert-file": "c.pem", "key-file": "k.pem", "min-version": "tls11"}}
        ]));
        assert!(err(&cfg).contains("min-version"));
        let cfg = config(json!([
            {"name": "tls", "type": "TlsServer",
             "settings": {"cert-file": "c.pem", "key-file": "k.pem", "min-version": "tls13", "max-version": "tls12"}}
        ]));
        assert!(err(&cfg).contains("greater than"));
    }

    #[test]
    fn unknown_setting_rejected() {
        let cfg = config(json!([
            {"name": "log", "type": "Logger", "settings": {"preview": 3}}
        ]));
        assert!(err(&cfg).contains("Logger(log).settings"));
    }

    #[test]
    fn dangling_device_rejected() {
        let cfg = config(json!([
            {"name": "l3", "type": "Layer3Sender", "settings": {"device": "tun0"}}
        ]));
        assert!(err(&cfg).contains("device node 'tun0' does not exist"));
    }

    #[test]
    fn device_inside_a_chain_rejected() {
        let cfg = config(json!([
            {"name": "l3", "type": "Layer3Sender", "settings": {"device": "b"}},
            {"name": "a", "type": "Logger", "next": "b"},
            {"name": "b", "type": "Logger"}
        ]));
        assert!(err(&cfg).contains("must head its own chain"));
    }

    #[test]
    fn device_cycle_rejected() {
        let cfg = config(json!([
            {"name": "a", "type": "Layer3Sender", "settings": {"device": "b"}},
            {"name": "b", "type": "Layer3Sender", "settings": {"device": "a"}}
        ]));
        assert!(err(&cfg).contains("cycle"));
    }

    #[test]
    fn device_dag_accepted() {
        let cfg = config(json!([
            {"name": "in", "type": "TcpListener", "settings": {"address": "0.0.0.0", "port": 80}, "next": "l3"},
            {"name": "l3", "type": "Layer3Sender", "settings": {"device": "tun"}},
            {"name": "tun", "type": "Logger"}
        ]));
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn logging_format_checked() {
        let mut cfg = config(json!([{"name": "log", "type": "Logger"}]));
        cfg.logging.format = Some("xml".into());
        assert!(err(&cfg).contains("logging.format"));
    }

    #[test]
    fn small_buffer_rejected() {
        let mut cfg = config(json!([{"name": "log", "type": "Logger"}]));
        cfg.core.buffer_size = 16;
        assert!(err(&cfg).contains("buffer-size"));
    }
}
