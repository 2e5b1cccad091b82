//! Clap derive structures for the `gwconsole` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// gwconsole -- follow OpenWiFi gateway device events from a terminal
#[derive(Debug, Parser)]
#[command(
    name = "gwconsole",
    version,
    about = "Follow OpenWiFi gateway device events from the command line",
    long_about = "Subscribes to the gateway's device notification stream and prints\n\
        matching events, or waits for an asynchronous device command (such as a\n\
        packet trace) to finish.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "GWCONSOLE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Gateway REST URL (overrides config)
    #[arg(long, short = 'g', global = true)]
    pub gateway: Option<String>,

    /// Notification WebSocket URL (overrides config)
    #[arg(long, global = true)]
    pub websocket: Option<String>,

    /// Bearer token (overrides config)
    #[arg(long, env = "GWCONSOLE_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a device's events as JSON lines until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Wait for a device command's file (e.g. a packet trace) to be ready
    #[command(alias = "wt")]
    WaitTrace(WaitTraceArgs),

    /// Inspect or initialise configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Device serial number
    pub serial: String,

    /// Event kind to follow; repeatable (default: connection, disconnection,
    /// firmware upgrade, statistics)
    #[arg(long = "topic", short = 't', value_name = "KIND")]
    pub topics: Vec<String>,

    /// Re-fetch and print the device status after every event
    #[arg(long)]
    pub status: bool,

    /// Exit after this many events
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

#[derive(Debug, Args)]
pub struct WaitTraceArgs {
    /// Device serial number
    pub serial: String,

    /// UUID of the trace command
    pub command_uuid: String,

    /// Seconds between status checks (overrides config)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Give up after this many seconds (exit code 8)
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,
    /// Print the effective configuration (token redacted)
    Show,
    /// Write the effective configuration (file, environment, and flags)
    /// to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
