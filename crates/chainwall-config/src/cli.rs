//! CLI override definitions and application logic.

use clap::Parser;

use crate::Config;

#[derive(Debug, Clone, Parser, Default)]
pub struct CliOverrides {
    /// Override worker thread count (0 = one per CPU)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Override pooled buffer size (bytes)
    #[arg(long)]
    pub buffer_size: Option<usize>,
    /// Override idle buffers kept per worker
    #[arg(long)]
    pub pool_max_free: Option<usize>,
    /// Override graceful shutdown timeout (seconds)
    #[arg(long)]
    pub shutdown_timeout_secs: Option<u64>,
    /// TCP listener backlog size
    #[arg(long)]
    pub connection_backlog: Option<u32>,
    /// Override metrics listen address
    #[arg(long)]
    pub metrics_listen: Option<String>,
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,
    /// Override log format (json/pretty/compact)
    #[arg(long)]
    pub log_format: Option<String>,
    /// Override log file directory
    #[arg(long)]
    pub log_dir: Option<String>,
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(v) = overrides.workers {
        config.core.workers = v;
    }
    if let Some(v) = overrides.buffer_size {
        config.core.buffer_size = v;
    }
    if let Some(v) = overrides.pool_max_free {
        config.core.pool_max_free = v;
    }
    if let Some(v) = overrides.shutdown_timeout_secs {
        config.core.shutdown_timeout_secs = v;
    }
    if let Some(v) = overrides.connection_backlog {
        config.core.connection_backlog = v;
    }
    if let Some(v) = &overrides.metrics_listen {
        config.metrics.listen = Some(v.clone());
    }
    if let Some(v) = &overrides.log_level {
        config.logging.level = Some(v.clone());
    }
    if let Some(v) = &overrides.log_format {
        config.logging.format = Some(v.clone());
    }
    if let Some(v) = &overrides.log_dir {
        config.logging.directory = Some(v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut cfg: Config = serde_json::from_str(
            r#"{"core": {"workers": 4}, "nodes": [{"name": "log", "type": "Logger"}]}"#,
        )
        .unwrap();
        let overrides = CliOverrides::parse_from([
            "chainwall",
            "--log-level",
            "trace",
            "--metrics-listen",
            "127.0.0.1:9100",
        ]);
        apply_overrides(&mut cfg, &overrides);
        assert_eq!(cfg.core.workers, 4);
        assert_eq!(cfg.logging.level.as_deref(), Some("trace"));
        assert_eq!(cfg.metrics.listen.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn log_dir_override_enables_file_logging() {
        let mut cfg: Config =
            serde_json::from_str(r#"{"nodes": [{"name": "log", "type": "Logger"}]}"#).unwrap();
        assert!(cfg.logging.directory.is_none());
        let overrides = CliOverrides::parse_from(["chainwall", "--log-dir", "/var/log/chainwall"]);
        apply_overrides(&mut cfg, &overrides);
        assert_eq!(cfg.logging.directory.as_deref(), Some("/var/log/chainwall"));
    }

    #[test]
    fn worker_override() {
        let mut cfg: Config =
            serde_json::from_str(r#"{"nodes": [{"name": "log", "type": "Logger"}]}"#).unwrap();
        apply_overrides(
            &mut cfg,
            &CliOverrides {
                workers: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(cfg.core.workers, 3);
    }
}
