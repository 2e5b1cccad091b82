// Gateway REST client
//
// Thin wrapper over `reqwest::Client` for the handful of gateway endpoints
// that notification consumers re-fetch after a push event, and that the
// polling watcher checks while a device produces an artifact (trace file,
// script output). Everything else the console does over REST is out of
// scope for this crate.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

// ── Response models ──────────────────────────────────────────────────

/// Status of a command previously issued to a device.
///
/// `waiting_for_file` is non-zero while the device is still producing the
/// file attached to the command (e.g. a packet trace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    #[serde(rename = "UUID", default)]
    pub uuid: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub command: String,
    #[serde(default = "still_waiting")]
    pub waiting_for_file: u64,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub completed: i64,
}

// Absence of the field says nothing about the file; keep waiting.
fn still_waiting() -> u64 {
    1
}

/// Live connection status of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub firmware: String,
    #[serde(default)]
    pub last_contact: i64,
    #[serde(default)]
    pub associations_2g: u64,
    #[serde(default)]
    pub associations_5g: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_description: Option<String>,
}

// ── GatewayClient ────────────────────────────────────────────────────

/// HTTP client for the gateway REST API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: Url,
    timeout_secs: u64,
}

impl GatewayClient {
    /// Create a client for `base_url` (e.g. `https://gw.example.com:16002`).
    ///
    /// When `token` is set every request carries `Authorization: Bearer`.
    pub fn new(
        base_url: Url,
        token: Option<&SecretString>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::Authentication {
                    message: format!("token is not a valid header value: {e}"),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let http = transport.build_client_with_headers(headers)?;
        Ok(Self {
            http,
            base_url,
            timeout_secs: transport.timeout.as_secs(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `GET /api/v1/command/{uuid}`
    pub async fn command_status(&self, command_uuid: &str) -> Result<CommandStatus, Error> {
        let url = self.api_url(&["command", command_uuid])?;
        self.get(url).await
    }

    /// `GET /api/v1/device/{serial}/status`
    pub async fn device_status(&self, serial_number: &str) -> Result<DeviceStatus, Error> {
        let url = self.api_url(&["device", serial_number, "status"])?;
        self.get(url).await
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Build `{base}/api/v1/{segments...}` with each segment percent-encoded.
    fn api_url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.request_error(e))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Authentication {
                message: format!("gateway returned HTTP {status}"),
            });
        }

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_description)
                .unwrap_or_else(|| status.to_string());
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            Error::Transport(err)
        }
    }
}
