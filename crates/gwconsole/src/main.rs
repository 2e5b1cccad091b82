mod cli;
mod commands;
mod config;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Logs go to stderr so `watch` output stays pipeable. `RUST_LOG` wins
/// over `-v`.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let directives = if verbosity < 3 {
        // Keep dependency chatter (hyper, tungstenite) at warn below -vvv.
        format!("warn,gwconsole={level},gwconsole_core={level},gwconsole_api={level}")
    } else {
        level.to_owned()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)),
        )
        .with_target(verbosity >= 2)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let Cli { global, command } = cli;

    if let Command::Config(args) = &command {
        return commands::config_cmd::handle(args, &global);
    }

    let cfg = config::resolve(&global)?;
    tracing::debug!(command = ?command, gateway = ?cfg.gateway.url, "dispatching command");
    commands::dispatch(command, &cfg).await
}
