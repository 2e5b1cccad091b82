//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use gwconsole_config::ConfigError;
use gwconsole_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const FAILED: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the gateway at {url}")]
    #[diagnostic(
        code(gwconsole::connection_failed),
        help(
            "Check that the gateway is running and reachable.\n\
             URL: {url}\n\
             Self-signed certificate? Try --insecure."
        )
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(gwconsole::auth_failed),
        help("Pass a valid token with --token, GWCONSOLE_TOKEN, or gateway.token in the config file.")
    )]
    AuthFailed { message: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(code(gwconsole::not_found))]
    NotFound {
        resource_type: String,
        identifier: String,
    },

    // ── API ──────────────────────────────────────────────────────────
    #[error("Gateway API error ({code}): {message}")]
    #[diagnostic(code(gwconsole::api_error))]
    ApiError { code: String, message: String },

    // ── Command outcomes ─────────────────────────────────────────────
    #[error("Trace {command_uuid} failed: {reason}")]
    #[diagnostic(
        code(gwconsole::trace_failed),
        help("The device reported an error; issue the trace command again.")
    )]
    TraceFailed {
        command_uuid: String,
        reason: String,
    },

    #[error("Interrupted")]
    #[diagnostic(code(gwconsole::interrupted))]
    Interrupted,

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(gwconsole::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("No gateway configured")]
    #[diagnostic(
        code(gwconsole::no_gateway),
        help(
            "Pass --gateway, set GWCONSOLE_GATEWAY__URL, or add gateway.url to\n\
             {path}"
        )
    )]
    NoGateway { path: String },

    #[error(transparent)]
    #[diagnostic(code(gwconsole::config))]
    Config(Box<figment::Error>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(gwconsole::timeout),
        help(
            "Raise --timeout for slow gateway requests, or --deadline for wait-trace.\n\
             Check gateway responsiveness."
        )
    )]
    Timeout { seconds: u64 },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(gwconsole::internal))]
    Internal(String),

    // ── IO / Serialization ────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode JSON: {0}")]
    #[diagnostic(code(gwconsole::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode TOML: {0}")]
    #[diagnostic(code(gwconsole::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::TraceFailed { .. } => exit_code::FAILED,
            Self::Interrupted => exit_code::INTERRUPTED,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::NoGateway { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::MissingGateway => CliError::NoGateway {
                path: gwconsole_config::config_path().display().to_string(),
            },
            ConfigError::Figment(err) => CliError::Config(err),
            ConfigError::Serialization(err) => CliError::Toml(err),
            ConfigError::Io(err) => CliError::Io(err),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Transport { message, .. } => CliError::ConnectionFailed {
                url: "(gateway)".into(),
                source: message.into(),
            },

            CoreError::RetriesExhausted {
                attempts,
                last_error,
            } => CliError::ConnectionFailed {
                url: "(gateway)".into(),
                source: format!("gave up after {attempts} attempts: {last_error}").into(),
            },

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },

            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::NotFound { identifier } => CliError::NotFound {
                resource_type: "resource".into(),
                identifier,
            },

            CoreError::Api { message, status } => CliError::ApiError {
                code: status.map_or_else(|| "unknown".into(), |s| s.to_string()),
                message,
            },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::InvalidState { operation, state } => {
                CliError::Internal(format!("cannot {operation} while {state}"))
            }

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

impl From<gwconsole_api::Error> for CliError {
    fn from(err: gwconsole_api::Error) -> Self {
        CoreError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(
            CliError::AuthFailed {
                message: "nope".into()
            }
            .exit_code(),
            exit_code::AUTH
        );
        assert_eq!(CliError::Interrupted.exit_code(), 130);
        assert_eq!(
            CliError::from(ConfigError::MissingGateway).exit_code(),
            exit_code::USAGE
        );
        assert_eq!(
            CliError::from(CoreError::RetriesExhausted {
                attempts: 10,
                last_error: "refused".into()
            })
            .exit_code(),
            exit_code::CONNECTION
        );
        assert_eq!(
            CliError::from(gwconsole_api::Error::Timeout { timeout_secs: 30 }).exit_code(),
            exit_code::TIMEOUT
        );
    }
}
