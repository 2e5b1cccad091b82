//! Gateway notification WebSocket.
//!
//! The gateway pushes device notifications (connect/disconnect, firmware
//! upgrade, statistics, command completion) over a WebSocket. This module
//! only knows how to open that link and decode frames into
//! [`InboundMessage`]s. Reconnect policy and fan-out live in
//! `gwconsole-core`, which talks to the link through the [`Connector`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use gwconsole_api::websocket::{Connector, WebSocketConnector};
//! use url::Url;
//!
//! let connector = WebSocketConnector::new(Url::parse("wss://gw.example.com/api/v1/ws")?, None);
//! let mut stream = connector.connect().await?;
//!
//! while let Some(Ok(msg)) = stream.next().await {
//!     println!("{} {}", msg.device_id, msg.topic);
//! }
//! ```

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use url::Url;

use crate::error::Error;

// ── InboundMessage ───────────────────────────────────────────────────

/// A decoded device notification from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Notification kind, e.g. `"device_connection"`.
    pub topic: String,

    /// Serial number of the device the notification is about.
    pub device_id: String,

    /// Notification content as sent by the gateway.
    pub payload: serde_json::Value,

    /// When the frame was decoded locally.
    pub received_at: DateTime<Utc>,
}

/// Stream of decoded messages for a single connection.
///
/// The stream ending means the peer closed the link; an `Err` item means
/// the link failed.
pub type MessageStream = BoxStream<'static, Result<InboundMessage, Error>>;

// ── Connector ────────────────────────────────────────────────────────

/// Opens one live notification link per call.
///
/// Implementations must not retry internally; the caller owns reconnects.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<MessageStream, Error>>;
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    token: Option<SecretString>,
}

impl WebSocketConnector {
    /// `token` is sent as a bearer token on the upgrade request.
    pub fn new(url: Url, token: Option<SecretString>) -> Self {
        Self { url, token }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<MessageStream, Error>> {
        let url = self.url.clone();
        let token = self.token.clone();
        async move { open_stream(&url, token.as_ref()).await }.boxed()
    }
}

// ── Single connection ────────────────────────────────────────────────

async fn open_stream(url: &Url, token: Option<&SecretString>) -> Result<MessageStream, Error> {
    tracing::info!(url = %url, "Connecting to notification WebSocket");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(token) = token {
        request = request.with_header("Authorization", format!("Bearer {}", token.expose_secret()));
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(upgrade_error)?;

    tracing::info!("Notification WebSocket connected");

    // tungstenite answers pings while the read half is polled.
    let (_write, read) = ws_stream.split();

    Ok(read
        .filter_map(|frame| futures_util::future::ready(decode_frame(frame)))
        .boxed())
}

fn upgrade_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(ref response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Error::Authentication {
                message: format!("gateway rejected WebSocket upgrade (HTTP {})", response.status()),
            }
        }
        other => Error::WebSocketConnect(other.to_string()),
    }
}

fn decode_frame(
    frame: Result<tungstenite::Message, tungstenite::Error>,
) -> Option<Result<InboundMessage, Error>> {
    match frame {
        Ok(tungstenite::Message::Text(text)) => parse_notification(&text).map(Ok),
        Ok(tungstenite::Message::Close(frame)) => {
            let Some(cf) = frame else {
                tracing::info!("WebSocket close frame received (no payload)");
                return None;
            };
            tracing::info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
            match cf.code {
                CloseCode::Normal | CloseCode::Away => None,
                code => Some(Err(Error::WebSocketClosed {
                    code: u16::from(code),
                    reason: cf.reason.to_string(),
                })),
            }
        }
        Ok(_) => None,
        Err(e) => Some(Err(Error::WebSocketConnect(e.to_string()))),
    }
}

// ── Message parsing ──────────────────────────────────────────────────

/// Envelope the gateway wraps around every push notification:
/// `{ "notification": { "type": "...", "content": { "serialNumber": "...", ... } } }`.
#[derive(Debug, Deserialize)]
struct NotificationFrame {
    notification: Notification,
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Decode a text frame. Frames that are not device notifications are
/// skipped; many gateway frames (command acks, heartbeats) carry no device.
fn parse_notification(text: &str) -> Option<InboundMessage> {
    let frame: NotificationFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping non-notification WebSocket frame");
            return None;
        }
    };

    let Some(serial) = frame.notification.content["serialNumber"].as_str() else {
        tracing::debug!(kind = %frame.notification.kind, "Notification without serial number");
        return None;
    };

    Some(InboundMessage {
        topic: frame.notification.kind,
        device_id: serial.to_owned(),
        payload: frame.notification.content,
        received_at: Utc::now(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use futures_util::SinkExt;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio::net::TcpListener;

    #[test]
    fn parse_device_connection_notification() {
        let raw = serde_json::json!({
            "notification": {
                "notificationId": 17,
                "type": "device_connection",
                "content": { "serialNumber": "24f5a2e1b0c4", "firmware": "TIP-v2.9" }
            }
        });

        let msg = parse_notification(&raw.to_string()).unwrap();
        assert_eq!(msg.topic, "device_connection");
        assert_eq!(msg.device_id, "24f5a2e1b0c4");
        assert_eq!(msg.payload["firmware"], "TIP-v2.9");
    }

    #[test]
    fn notification_without_serial_is_skipped() {
        let raw = serde_json::json!({
            "notification": { "type": "device_statistics", "content": {} }
        });
        assert!(parse_notification(&raw.to_string()).is_none());
    }

    #[test]
    fn malformed_frame_is_skipped() {
        assert!(parse_notification("not json at all").is_none());
        assert!(parse_notification(r#"{"command_response": {"uuid": "x"}}"#).is_none());
    }

    #[test]
    fn read_errors_become_error_items() {
        let item = decode_frame(Err(tungstenite::Error::ConnectionClosed)).unwrap();
        assert!(matches!(item, Err(Error::WebSocketConnect(_))));
    }

    #[test]
    fn abnormal_close_is_reported_with_its_reason() {
        let close = tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "gateway restarting".into(),
        }));
        let item = decode_frame(Ok(close)).unwrap();
        let Err(Error::WebSocketClosed { code, reason }) = item else {
            panic!("expected WebSocketClosed, got {item:?}");
        };
        assert_eq!(code, 1011);
        assert_eq!(reason, "gateway restarting");
    }

    #[test]
    fn normal_close_just_ends_the_stream() {
        let close = tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        assert!(decode_frame(Ok(close)).is_none());
        assert!(decode_frame(Ok(tungstenite::Message::Close(None))).is_none());
    }

    #[tokio::test]
    async fn connector_streams_notifications_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let frame = serde_json::json!({
                "notification": {
                    "type": "device_firmware_upgrade",
                    "content": { "serialNumber": "SN123", "version": "2.10" }
                }
            });
            ws.send(tungstenite::Message::text(r#"{"heartbeat": 1}"#))
                .await
                .unwrap();
            ws.send(tungstenite::Message::text(frame.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            // Drain until the client's close reply arrives.
            while ws.next().await.is_some() {}
        });

        let url = Url::parse(&format!("ws://{addr}/api/v1/ws")).unwrap();
        let connector = WebSocketConnector::new(url, Some(SecretString::from("t0ken")));
        let mut stream = connector.connect().await.unwrap();

        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.topic, "device_firmware_upgrade");
        assert_eq!(msg.device_id, "SN123");
        assert!(stream.next().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_upgrade_is_an_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut tcp, &mut buf).await;
            tcp.write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let url = Url::parse(&format!("ws://{addr}/api/v1/ws")).unwrap();
        let Err(err) = WebSocketConnector::new(url, None).connect().await else {
            panic!("upgrade should have been rejected");
        };
        assert!(err.is_auth_error(), "unexpected error: {err}");
        assert!(!err.is_transient());
    }
}
