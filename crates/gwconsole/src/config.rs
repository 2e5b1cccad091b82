//! CLI-side configuration: the shared loader plus `GlobalOpts` overrides.

use std::path::PathBuf;

use gwconsole_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file in effect: `--config` / `GWCONSOLE_CONFIG`, else the
/// platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(gwconsole_config::config_path)
}

/// Load the config file + environment, then apply command-line flags.
pub fn resolve(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = config_file(global);
    let mut cfg = gwconsole_config::load_from(&path)?;

    if let Some(ref url) = global.gateway {
        cfg.gateway.url = Some(url.clone());
    }
    if let Some(ref url) = global.websocket {
        cfg.gateway.websocket_url = Some(url.clone());
    }
    if let Some(ref token) = global.token {
        cfg.gateway.token = Some(token.clone());
        cfg.gateway.token_env = None;
    }
    if global.insecure {
        cfg.gateway.insecure = true;
    }
    if let Some(timeout) = global.timeout {
        cfg.gateway.timeout_secs = timeout;
    }

    cfg.validate()?;
    if cfg.gateway.url.is_none() {
        return Err(CliError::NoGateway {
            path: path.display().to_string(),
        });
    }
    Ok(cfg)
}
