//! Command dispatch: bridges CLI args -> core services -> stdout.

pub mod config_cmd;
pub mod wait_trace;
pub mod watch;

use gwconsole_config::Config;

use crate::cli::Command;
use crate::error::CliError;

/// Dispatch a gateway-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, cfg: &Config) -> Result<(), CliError> {
    match cmd {
        Command::Watch(args) => watch::handle(&args, cfg).await,
        Command::WaitTrace(args) => wait_trace::handle(args, cfg).await,
        // Config is handled before dispatch
        Command::Config(args) => Err(CliError::Internal(format!(
            "config command dispatched to gateway handler: {args:?}"
        ))),
    }
}
