//! CLI module for the chainwall server.
//!
//! Used by the `chainwall` binary for its `run` and `check` subcommands.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chainwall_config::{
    CliOverrides, Config, LoggingConfig, apply_overrides, load_config, validate_config,
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Layer, Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::server::build_only;
use crate::{CancellationToken, run_with_shutdown};

/// Server CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "chainwall-server", version, about = "Composable tunnel chain server")]
pub struct ServerArgs {
    /// Config file path (json/jsonc/yaml/toml)
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: CliOverrides,
}

/// Load, override and validate the configuration named by `args`.
pub fn prepare_config(args: &ServerArgs) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;
    Ok(config)
}

/// Run the server until SIGINT/SIGTERM.
pub async fn run(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = prepare_config(&args)?;

    init_tracing(&config.logging)?;
    crate::limits::log_file_limit();

    if let Some(listen) = &config.metrics.listen {
        match chainwall_metrics::init_prometheus(listen) {
            Ok(()) => info!("metrics exporter listening on {}", listen),
            Err(e) => warn!("failed to start metrics exporter: {}", e),
        }
    }

    // Set up graceful shutdown on SIGTERM/SIGINT
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        shutdown_signal.cancel();
    });

    run_with_shutdown(config, shutdown).await?;
    Ok(())
}

/// Validate the configuration and build every chain without binding sockets.
///
/// Certificates and keys are loaded, so a missing file fails here too.
pub fn check(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = prepare_config(&args)?;
    let (chains, acceptors) = build_only(&config)?;
    println!(
        "{}: ok ({} nodes, {} chains, {} acceptors)",
        args.config.display(),
        config.nodes.len(),
        chains,
        acceptors
    );
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Build the `EnvFilter` directive string from the logging configuration.
fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.level.as_deref().unwrap_or("info").to_string();
    let mut modules: Vec<_> = config.filters.iter().collect();
    modules.sort();
    for (module, level) in modules {
        directives.push(',');
        directives.push_str(module);
        directives.push('=');
        directives.push_str(level);
    }
    directives
}

/// Log file a tracing layer writes to.
#[derive(Clone)]
struct LogFile {
    file: Arc<File>,
    network: bool,
}

/// Events from these targets go to the network log file.
const NETWORK_TARGETS: &[&str] = &["chainwall_tunnels", "rustls"];

fn is_network_target(target: &str) -> bool {
    NETWORK_TARGETS.iter().any(|t| target.starts_with(t))
}

/// Create the log directory and open the core and network log files in
/// append mode. Nothing is opened without a configured directory.
fn open_log_files(config: &LoggingConfig) -> io::Result<Vec<LogFile>> {
    let Some(dir) = &config.directory else {
        return Ok(Vec::new());
    };
    let dir = Path::new(dir);
    fs::create_dir_all(dir)?;
    let open = |name: &str| -> io::Result<Arc<File>> {
        let file = OpenOptions::new().create(true).append(true).open(dir.join(name))?;
        Ok(Arc::new(file))
    };
    Ok(vec![
        LogFile {
            file: open(config.core_file.as_deref().unwrap_or("core.log"))?,
            network: false,
        },
        LogFile {
            file: open(config.network_file.as_deref().unwrap_or("network.log"))?,
            network: true,
        },
    ])
}

type Base = Layered<EnvFilter, Registry>;

fn file_layers(files: &[LogFile]) -> Vec<Box<dyn Layer<Base> + Send + Sync>> {
    files
        .iter()
        .map(|f| {
            let network = f.network;
            fmt::layer()
                .with_ansi(false)
                .with_writer(f.file.clone())
                .with_filter(filter_fn(move |meta| {
                    is_network_target(meta.target()) == network
                }))
                .boxed()
        })
        .collect()
}

/// Initialize tracing subscriber with the given logging configuration.
///
/// Supports:
/// - `level`: Base log level (trace, debug, info, warn, error)
/// - `format`: Output format (json, pretty, compact). Default: pretty
/// - `output`: Output target (stdout, stderr). Default: stderr
/// - `filters`: Per-module log level overrides
/// - `directory`: Also write core and network log files there
pub fn init_tracing(config: &LoggingConfig) -> io::Result<()> {
    let filter =
        EnvFilter::try_new(filter_directives(config)).unwrap_or_else(|_| EnvFilter::new("info"));
    let files = open_log_files(config)?;
    let base = tracing_subscriber::registry()
        .with(filter)
        .with(file_layers(&files));

    let format = config.format.as_deref().unwrap_or("pretty");
    let output = config.output.as_deref().unwrap_or("stderr");

    match (format, output) {
        ("json", "stdout") => base.with(fmt::layer().json().with_writer(io::stdout)).init(),
        ("json", _) => base.with(fmt::layer().json().with_writer(io::stderr)).init(),
        ("compact", "stdout") => base.with(fmt::layer().compact().with_writer(io::stdout)).init(),
        ("compact", _) => base.with(fmt::layer().compact().with_writer(io::stderr)).init(),
        (_, "stdout") => base.with(fmt::layer().with_writer(io::stdout)).init(),
        _ => base.with(fmt::layer().with_writer(io::stderr)).init(),
    }

    if let Some(dir) = &config.directory {
        info!(directory = %dir, "writing log files");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_default_to_config_json() {
        let args = ServerArgs::try_parse_from(["chainwall-server"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.overrides.workers, None);
    }

    #[test]
    fn args_accept_overrides() {
        let args = ServerArgs::try_parse_from([
            "chainwall-server",
            "-c",
            "/etc/chainwall.toml",
            "--workers",
            "3",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/chainwall.toml"));
        assert_eq!(args.overrides.workers, Some(3));
        assert_eq!(args.overrides.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn directives_include_module_filters() {
        let mut config = LoggingConfig {
            level: Some("warn".into()),
            ..LoggingConfig::default()
        };
        config.filters.insert("rustls".into(), "error".into());
        config.filters.insert("chainwall_tunnels".into(), "debug".into());
        assert_eq!(
            filter_directives(&config),
            "warn,chainwall_tunnels=debug,rustls=error"
        );
    }

    #[test]
    fn directives_default_to_info() {
        assert_eq!(filter_directives(&LoggingConfig::default()), "info");
    }

    #[test]
    fn no_directory_means_no_log_files() {
        assert!(open_log_files(&LoggingConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn log_files_are_created_under_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs/nested");
        let config = LoggingConfig {
            directory: Some(dir.to_string_lossy().into_owned()),
            network_file: Some("net.log".into()),
            ..LoggingConfig::default()
        };

        let files = open_log_files(&config).unwrap();
        assert_eq!(files.len(), 2);
        assert!(!files[0].network);
        assert!(files[1].network);
        assert!(dir.join("core.log").is_file());
        assert!(dir.join("net.log").is_file());

        use std::io::Write;
        (&*files[1].file).write_all(b"line\n").unwrap();
        assert_eq!(fs::read_to_string(dir.join("net.log")).unwrap(), "line\n");
    }

    #[test]
    fn tunnel_events_go_to_the_network_file() {
        assert!(is_network_target("chainwall_tunnels::tcp_listener"));
        assert!(is_network_target("rustls::server"));
        assert!(!is_network_target("chainwall_server::worker"));
        assert!(!is_network_target("chainwall_core::line"));
    }
}
