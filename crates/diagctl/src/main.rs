//! diagctl - Command-line tool for DoIP vehicle diagnostics
//!
//! Discovers DoIP entities, checks routing activation and sends raw
//! diagnostic requests through the diag-client library.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diag_client::DiagnosticManager;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "diagctl")]
#[command(author, version, about = "DoIP diagnostic client CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Client configuration file (.json or .toml)
    #[arg(short, long, env = "DIAGCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast a vehicle identification request and list the answers
    Discover {
        /// Only entities of the vehicle with this VIN answer
        #[arg(long, conflicts_with = "eid")]
        vin: Option<String>,

        /// Only the entity with this EID answers (e.g. 00:02:36:31:00:1c)
        #[arg(long)]
        eid: Option<String>,

        /// Collection window in milliseconds (default from config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Connect and activate routing, then disconnect
    Connect {
        #[command(flatten)]
        target: commands::TargetArgs,
    },

    /// Send one diagnostic request and print the response
    Send {
        #[command(flatten)]
        target: commands::TargetArgs,

        /// Request bytes as hex (e.g. "10 01" or 1001)
        #[arg(required = true)]
        payload: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("diagctl=debug,diag_client=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("diagctl=info,diag_client=info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = config::load(cli.config.as_deref())?;
    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    let manager = DiagnosticManager::new(config).context("Invalid client configuration")?;
    manager
        .initialize()
        .context("Failed to start diagnostic client")?;

    let result = match &cli.command {
        Commands::Discover {
            vin,
            eid,
            timeout_ms,
        } => commands::discover(&manager, vin.as_deref(), eid.as_deref(), *timeout_ms, &ctx),
        Commands::Connect { target } => commands::connect(&manager, target, &ctx),
        Commands::Send { target, payload } => commands::send(&manager, target, payload, &ctx),
    };

    manager.deinitialize();
    result
}
