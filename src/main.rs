//! AuthBridge - transparent bidirectional authentication sidecar
//!
//! `serve` runs the external-processing filter; `intercept` installs the
//! traffic-redirection rules once and exits.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use authbridge::{
    cli::{Cli, Command},
    config::{FilterConfig, InterceptConfig},
    filter, interceptor, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Intercept) => run_intercept(),
        Some(Command::Serve) | None => run_server().await,
    }
}

/// Install the firewall rules once; exit 0 signals the application
/// container may start
fn run_intercept() -> ExitCode {
    let config = match InterceptConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load interceptor configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match interceptor::install(&config) {
        Ok(()) => {
            info!("Interception rules installed, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to install interception rules: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the filter server until shutdown
async fn run_server() -> ExitCode {
    let config = match FilterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load filter configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_port = config.grpc_port,
        "Starting AuthBridge filter"
    );

    if let Err(e) = filter::run(config).await {
        error!("Filter error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
