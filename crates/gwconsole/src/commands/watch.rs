//! `watch`: print a device's events as JSON lines.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gwconsole_api::{DeviceStatus, GatewayClient, WebSocketConnector};
use gwconsole_config::Config;
use gwconsole_core::{DeviceEventRegistry, Event, EventBus, ListenerRegistration, Topic};

use crate::cli::WatchArgs;
use crate::error::CliError;

pub async fn handle(args: &WatchArgs, cfg: &Config) -> Result<(), CliError> {
    let ws_url = cfg.websocket_url()?;
    let status_client = if args.status {
        Some(GatewayClient::new(
            cfg.gateway_url()?,
            cfg.token().as_ref(),
            &cfg.transport_config(),
        )?)
    } else {
        None
    };

    let bus = EventBus::new();
    let registry = DeviceEventRegistry::new(
        WebSocketConnector::new(ws_url.clone(), cfg.token()),
        bus.clone(),
        cfg.registry_config(),
    );

    // Callbacks run on the registry's task; hand events to this one.
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let errors = tx.clone();
    let error_sub = bus.subscribe(Topic::TRANSPORT_ERROR, move |event: &Event| {
        let _ = errors.send(event.clone());
    });

    let topics: Vec<Topic> = if args.topics.is_empty() {
        Topic::device_lifecycle().to_vec()
    } else {
        args.topics.iter().map(Topic::new).collect()
    };
    info!(device = %args.serial, ?topics, "watching");

    registry.add_listener(
        ListenerRegistration::new(args.serial.as_str(), move |event: &Event| {
            let _ = tx.send(event.clone());
        })
        .topics(topics)
        .topic(Topic::TRANSPORT_CONNECTED),
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0_usize;
    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("interrupted");
                break Ok(());
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };

                if event.topic == Topic::TRANSPORT_ERROR {
                    let reason = event.payload["error"]
                        .as_str()
                        .unwrap_or("notification link failed")
                        .to_owned();
                    break Err(CliError::ConnectionFailed {
                        url: ws_url.to_string(),
                        source: reason.into(),
                    });
                }

                if let Err(err) = print_event(&event, status_client.as_ref()).await {
                    break Err(err);
                }

                printed += 1;
                if args.count.is_some_and(|n| printed >= n) {
                    break Ok(());
                }
            }
        }
    };

    registry.remove_listener(&args.serial);
    bus.unsubscribe(&error_sub);
    registry.shutdown();
    result
}

/// One JSON line per event; with a status client, the freshly fetched
/// device status rides along. A failed fetch prints the event alone.
async fn print_event(event: &Event, status: Option<&GatewayClient>) -> Result<(), CliError> {
    let line = match (status, &event.device_id) {
        (Some(client), Some(device)) => {
            let current = fetch_status(client, device.as_str()).await;
            status_line(event, current.as_ref())?
        }
        _ => serde_json::to_string(event)?,
    };
    println!("{line}");
    Ok(())
}

async fn fetch_status(client: &GatewayClient, serial: &str) -> Option<DeviceStatus> {
    match client.device_status(serial).await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(device = serial, error = %e, "status fetch failed, printing event only");
            None
        }
    }
}

fn status_line(event: &Event, status: Option<&DeviceStatus>) -> Result<String, CliError> {
    Ok(serde_json::to_string(
        &json!({ "event": event, "status": status }),
    )?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use serde_json::Value;

    #[test]
    fn status_line_carries_null_when_fetch_failed() {
        let event = Event::for_device("SN1", Topic::DEVICE_CONNECTION, json!({}));

        let line: Value = serde_json::from_str(&status_line(&event, None).unwrap()).unwrap();
        assert_eq!(line["status"], Value::Null);
        assert_eq!(line["event"]["topic"], "device_connection");
    }

    #[tokio::test]
    async fn failed_status_fetch_is_not_fatal() {
        // Nothing listens on port 1.
        let client = GatewayClient::new(
            "http://127.0.0.1:1".parse().unwrap(),
            None,
            &gwconsole_api::TransportConfig::default(),
        )
        .unwrap();
        let event = Event::for_device("SN1", Topic::DEVICE_STATISTICS, json!({ "rx": 1 }));

        assert!(fetch_status(&client, "SN1").await.is_none());
        assert!(print_event(&event, Some(&client)).await.is_ok());
    }
}
