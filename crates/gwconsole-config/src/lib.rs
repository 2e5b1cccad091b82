//! Configuration for gwconsole.
//!
//! One TOML file plus `GWCONSOLE_*` environment overrides, translated into
//! the typed settings the api and core crates take: [`TransportConfig`],
//! [`RegistryConfig`] and [`PollOptions`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use gwconsole_api::{TlsMode, TransportConfig};
use gwconsole_core::{PollOptions, ReconnectConfig, RegistryConfig};

/// Environment variable prefix. Nested keys use `__`, e.g.
/// `GWCONSOLE_GATEWAY__URL`.
pub const ENV_PREFIX: &str = "GWCONSOLE_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no gateway URL configured")]
    MissingGateway,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub notifications: NotificationSection,

    #[serde(default)]
    pub polling: PollingSection,
}

/// Where the gateway lives and how to talk to it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewaySection {
    /// REST base URL (e.g., "https://gw.example.com:16002").
    pub url: Option<String>,

    /// Notification WebSocket URL. Derived from `url` when unset.
    pub websocket_url: Option<String>,

    /// Bearer token (plaintext; prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable holding the bearer token.
    pub token_env: Option<String>,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: None,
            websocket_url: None,
            token: None,
            token_env: None,
            ca_cert: None,
            insecure: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Notification link tuning.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotificationSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failed connects before giving up. `0` retries forever.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub jitter_ratio: f64,

    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            jitter_ratio: 0.0,
            linger_ms: default_linger_ms(),
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    10
}
fn default_linger_ms() -> u64 {
    2_000
}

/// Polling watcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollingSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Consecutive check errors tolerated. Unset retries forever.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            tick_ms: default_tick_ms(),
            max_consecutive_errors: None,
        }
    }
}

fn default_interval_ms() -> u64 {
    5_000
}
fn default_tick_ms() -> u64 {
    1_000
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "gwconsole", "gwconsole").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("gwconsole");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load config from `path` + environment. A missing file is not an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Validation & translation ────────────────────────────────────────

impl Config {
    /// Reject settings the registry or watcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.notifications;
        if n.initial_delay_ms == 0 {
            return Err(invalid("notifications.initial_delay_ms", "must be > 0"));
        }
        if n.max_delay_ms < n.initial_delay_ms {
            return Err(invalid(
                "notifications.max_delay_ms",
                format!("must be >= initial_delay_ms ({})", n.initial_delay_ms),
            ));
        }
        if !(0.0..=1.0).contains(&n.jitter_ratio) {
            return Err(invalid("notifications.jitter_ratio", "must be within 0.0..=1.0"));
        }

        let p = &self.polling;
        if p.interval_ms == 0 {
            return Err(invalid("polling.interval_ms", "must be > 0"));
        }
        if p.tick_ms == 0 {
            return Err(invalid("polling.tick_ms", "must be > 0"));
        }
        if p.max_consecutive_errors == Some(0) {
            return Err(invalid("polling.max_consecutive_errors", "must be > 0 when set"));
        }

        if self.gateway.timeout_secs == 0 {
            return Err(invalid("gateway.timeout_secs", "must be > 0"));
        }
        Ok(())
    }

    /// The REST base URL.
    pub fn gateway_url(&self) -> Result<Url, ConfigError> {
        let raw = self.gateway.url.as_deref().ok_or(ConfigError::MissingGateway)?;
        parse_url("gateway.url", raw)
    }

    /// The notification WebSocket URL: explicit, or `{url}/api/v1/ws` with
    /// the scheme switched to `ws`/`wss`.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        if let Some(raw) = self.gateway.websocket_url.as_deref() {
            return parse_url("gateway.websocket_url", raw);
        }

        let mut url = self.gateway_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(invalid(
                    "gateway.url",
                    format!("unsupported scheme '{other}'"),
                ));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| invalid("gateway.url", "cannot derive WebSocket URL"))?;
        url.path_segments_mut()
            .map_err(|()| invalid("gateway.url", "cannot be a base URL"))?
            .pop_if_empty()
            .extend(["api", "v1", "ws"]);
        Ok(url)
    }

    /// Bearer token: `token_env` wins over the plaintext `token`.
    pub fn token(&self) -> Option<SecretString> {
        if let Some(ref env_name) = self.gateway.token_env {
            if let Ok(val) = std::env::var(env_name) {
                return Some(SecretString::from(val));
            }
        }
        self.gateway.token.clone().map(SecretString::from)
    }

    pub fn transport_config(&self) -> TransportConfig {
        let tls = if self.gateway.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca_path) = self.gateway.ca_cert {
            TlsMode::CustomCa(ca_path.clone())
        } else {
            TlsMode::System
        };

        TransportConfig {
            tls,
            timeout: Duration::from_secs(self.gateway.timeout_secs),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        let n = &self.notifications;
        RegistryConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(n.initial_delay_ms),
                max_delay: Duration::from_millis(n.max_delay_ms),
                max_retries: (n.max_retries > 0).then_some(n.max_retries),
                jitter_ratio: n.jitter_ratio,
            },
            linger: Duration::from_millis(n.linger_ms),
        }
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(self.polling.interval_ms),
            tick: Duration::from_millis(self.polling.tick_ms),
            max_consecutive_errors: self.polling.max_consecutive_errors,
        }
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse()
        .map_err(|e: url::ParseError| invalid(field, format!("invalid URL '{raw}': {e}")))
}
