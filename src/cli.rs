//! Command-line interface definitions for `authbridge`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the [`Command`]
//! subcommand enum that drives the binary.

use clap::{Parser, Subcommand};

/// AuthBridge - transparent bidirectional authentication sidecar
///
/// Validates bearer tokens on inbound traffic and transparently re-mints
/// outbound tokens via OAuth 2.0 Token Exchange (RFC 8693). The `serve`
/// subcommand runs the long-lived external-processing filter; `intercept`
/// installs the packet-redirection rules once and exits.
///
/// Run without a subcommand to start the filter server.
#[derive(Parser, Debug)]
#[command(name = "authbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(
        long,
        default_value = "info",
        env = "AUTHBRIDGE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "AUTHBRIDGE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to filter server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the external-processing filter server (default when no
    /// subcommand is given)
    #[command(about = "Start the filter gRPC server")]
    Serve,

    /// Install the packet-redirection firewall rules and exit
    ///
    /// Runs once as an init step. Exit code 0 means the complete rule set
    /// is installed; the application container must start only after this.
    #[command(about = "Install traffic interception rules")]
    Intercept,
}
