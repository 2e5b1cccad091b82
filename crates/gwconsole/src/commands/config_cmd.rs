//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config;
use crate::error::CliError;

const REDACTED: &str = "<redacted>";

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", config::config_file(global).display());
            Ok(())
        }

        ConfigCommand::Show => {
            let mut cfg = gwconsole_config::load_from(&config::config_file(global))?;
            if cfg.gateway.token.is_some() {
                cfg.gateway.token = Some(REDACTED.into());
            }
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            let path = config::config_file(global);
            if path.exists() && !force {
                return Err(CliError::Validation {
                    field: "config".into(),
                    reason: format!(
                        "{} already exists (pass --force to overwrite)",
                        path.display()
                    ),
                });
            }

            let cfg = config::resolve(global)?;
            gwconsole_config::save_to(&cfg, &path)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        }
    }
}
