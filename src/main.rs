//! chainwall CLI.
//!
//! - `chainwall run` - Run the tunnel chains described by a config file
//! - `chainwall check` - Validate a config file and build its chains

use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// chainwall command-line interface.
#[derive(Parser)]
#[command(
    name = "chainwall",
    version,
    about = "Composable tunnel chains: TCP ingress, TLS termination, layer-3 injection",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server.
    #[command(name = "run", alias = "serve")]
    Run(Box<chainwall_server::cli::ServerArgs>),

    /// Validate the configuration and build every chain, then exit.
    #[command(name = "check")]
    Check(Box<chainwall_server::cli::ServerArgs>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => chainwall_server::cli::run(*args).await,
        Commands::Check(args) => chainwall_server::cli::check(*args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
