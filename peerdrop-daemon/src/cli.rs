//! Command Line and Logging

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// PeerDrop peer-to-peer file sharing
#[derive(Parser, Debug)]
#[command(name = "peerdrop-daemon")]
#[command(about = "Share files directly with peers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub timestamps: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/peerdrop/daemon.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Listen for peers and receive files until interrupted
    Serve {
        /// Peer alias or host:port to connect to on startup
        #[arg(long = "connect", value_name = "PEER")]
        connect: Vec<String>,
    },

    /// Send files to one or more peers and exit
    Send {
        /// Peer alias or host:port
        #[arg(long = "to", value_name = "PEER", required = true)]
        to: Vec<String>,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

/// Initialize logging; `RUST_LOG` takes precedence over `--log-level`
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );
    Ok(())
}
