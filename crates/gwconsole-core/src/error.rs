// ── Core error types ──
//
// Errors surfaced by the notification layer. Consumers never see HTTP
// status codes or raw WebSocket failures; the `From<gwconsole_api::Error>`
// impl folds transport-layer errors into these variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Transport errors ─────────────────────────────────────────────
    /// Connection-level failure on the notification link or a REST call.
    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Gave up reconnecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Polling errors ───────────────────────────────────────────────
    #[error("Watcher cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Not found: {identifier}")]
    NotFound { identifier: String },

    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transient errors are retried silently by the registry and the
    /// polling watcher.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            Self::Api { status, .. } => status.is_some_and(|s| s >= 500),
            _ => false,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<gwconsole_api::Error> for CoreError {
    fn from(err: gwconsole_api::Error) -> Self {
        let transient = err.is_transient();
        match err {
            gwconsole_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            gwconsole_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            gwconsole_api::Error::Api { status: 404, message } => {
                CoreError::NotFound { identifier: message }
            }
            gwconsole_api::Error::Api { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            gwconsole_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            gwconsole_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            other @ (gwconsole_api::Error::Transport(_)
            | gwconsole_api::Error::Tls(_)
            | gwconsole_api::Error::WebSocketConnect(_)
            | gwconsole_api::Error::WebSocketClosed { .. }) => CoreError::Transport {
                message: other.to_string(),
                transient,
            },
        }
    }
}
