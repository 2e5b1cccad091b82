#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use gwconsole_api::{Connector, InboundMessage, MessageStream};

use super::*;

// ── Scripted connector ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    Accept,
    /// Transient failure (connection refused).
    Refuse,
    /// Fatal failure (credentials rejected).
    Reject,
}

type LinkSender = mpsc::UnboundedSender<Result<InboundMessage, gwconsole_api::Error>>;

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Vec<LinkSender>>,
}

/// Connector whose outcomes follow a script; accepts once the script runs out.
#[derive(Clone, Default)]
struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    fn scripted(steps: impl IntoIterator<Item = Step>) -> Self {
        let mock = Self::default();
        mock.state.script.lock().unwrap().extend(steps);
        mock
    }

    fn attempts(&self) -> Vec<Instant> {
        self.state.attempts.lock().unwrap().clone()
    }

    fn live_links(&self) -> usize {
        self.state
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Push a notification down the most recent live link.
    fn emit(&self, serial: &str, topic: &str, payload: Value) {
        let links = self.state.links.lock().unwrap();
        let tx = links.iter().rev().find(|tx| !tx.is_closed()).unwrap();
        tx.send(Ok(InboundMessage {
            topic: topic.into(),
            device_id: serial.into(),
            payload,
            received_at: Utc::now(),
        }))
        .unwrap();
    }

    /// Simulate the gateway closing every open link.
    fn drop_links(&self) {
        self.state.links.lock().unwrap().clear();
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'static, Result<MessageStream, gwconsole_api::Error>> {
        self.state.attempts.lock().unwrap().push(Instant::now());
        let step = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Accept);

        let result = match step {
            Step::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.state.links.lock().unwrap().push(tx);
                Ok(UnboundedReceiverStream::new(rx).boxed())
            }
            Step::Refuse => Err(gwconsole_api::Error::WebSocketConnect(
                "connection refused".into(),
            )),
            Step::Reject => Err(gwconsole_api::Error::Authentication {
                message: "token rejected".into(),
            }),
        };
        futures_util::future::ready(result).boxed()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn registry_with(mock: &MockConnector, config: RegistryConfig) -> (DeviceEventRegistry, EventBus) {
    let bus = EventBus::new();
    let registry = DeviceEventRegistry::new(mock.clone(), bus.clone(), config);
    (registry, bus)
}

fn immediate_close() -> RegistryConfig {
    RegistryConfig {
        linger: Duration::ZERO,
        ..RegistryConfig::default()
    }
}

/// Registration that records every event it receives.
fn recording(
    serial: &str,
    topics: &[&'static str],
) -> (ListenerRegistration, Arc<Mutex<Vec<Event>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let registration = ListenerRegistration::new(serial, move |event: &Event| {
        sink.lock().unwrap().push(event.clone());
    })
    .topics(topics.iter().copied());
    (registration, seen)
}

/// Let spawned tasks run to quiescence.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("never reached {expected:?}"))
        .unwrap();
}

fn assert_near(actual: Duration, expected: Duration) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= Duration::from_millis(50),
        "expected ~{expected:?}, got {actual:?}"
    );
}

// ── Fan-out ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn delivers_only_matching_device_and_topic() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    let (registration, seen) = recording("SN123", &[Topic::DEVICE_CONNECTION]);

    registry.add_listener(registration);
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    mock.emit("SN123", Topic::DEVICE_CONNECTION, json!({ "n": 1 }));
    mock.emit("SN999", Topic::DEVICE_CONNECTION, json!({ "n": 2 }));
    mock.emit("SN123", Topic::DEVICE_STATISTICS, json!({ "n": 3 }));
    settle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].device_id.as_ref().unwrap().as_str(), "SN123");
    assert_eq!(seen[0].topic, Topic::DEVICE_CONNECTION);
    assert_eq!(seen[0].payload, json!({ "n": 1 }));
}

#[tokio::test(start_paused = true)]
async fn add_listener_replaces_previous_registration() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    let (first, first_seen) = recording("SN123", &[Topic::DEVICE_STATISTICS]);
    let (second, second_seen) = recording("SN123", &[Topic::DEVICE_STATISTICS]);

    registry.add_listener(first);
    registry.add_listener(second);
    settle().await;

    assert_eq!(registry.listener_count(), 1);
    mock.emit("SN123", Topic::DEVICE_STATISTICS, json!({}));
    settle().await;

    assert!(first_seen.lock().unwrap().is_empty());
    assert_eq!(second_seen.lock().unwrap().len(), 1);
    assert_eq!(mock.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn events_for_one_device_arrive_in_order() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    let (registration, seen) = recording("SN123", &[Topic::DEVICE_STATISTICS]);

    registry.add_listener(registration);
    settle().await;

    for n in 0..5 {
        mock.emit("SN123", Topic::DEVICE_STATISTICS, json!({ "n": n }));
    }
    settle().await;

    let order: Vec<Value> = seen.lock().unwrap().iter().map(|e| e.payload["n"].clone()).collect();
    assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_break_dispatch() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    let (healthy, seen) = recording("SN2", &[Topic::DEVICE_STATISTICS]);

    registry.add_listener(
        ListenerRegistration::new("SN1", |_| panic!("listener blew up"))
            .topic(Topic::DEVICE_STATISTICS),
    );
    registry.add_listener(healthy);
    settle().await;

    mock.emit("SN1", Topic::DEVICE_STATISTICS, json!({}));
    mock.emit("SN2", Topic::DEVICE_STATISTICS, json!({}));
    settle().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(*registry.connection_state().borrow(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn listener_may_remove_itself_from_its_callback() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, immediate_close());
    let hits = Arc::new(AtomicUsize::new(0));

    let handle = registry.clone();
    let counter = Arc::clone(&hits);
    registry.add_listener(
        ListenerRegistration::new("SN123", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            handle.remove_listener("SN123");
        })
        .topic(Topic::DEVICE_FIRMWARE_UPGRADE),
    );
    settle().await;

    mock.emit("SN123", Topic::DEVICE_FIRMWARE_UPGRADE, json!({}));
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!registry.has_listener("SN123"));
    assert!(!registry.is_transport_open());
}

// ── Reference-counted link ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn link_is_open_exactly_while_listeners_exist() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, immediate_close());
    assert!(!registry.is_transport_open());

    registry.add_listener(ListenerRegistration::new("A", |_| {}));
    registry.add_listener(ListenerRegistration::new("B", |_| {}));
    settle().await;
    assert!(registry.is_transport_open());
    assert_eq!(mock.attempts().len(), 1);
    assert_eq!(mock.live_links(), 1);

    assert!(registry.remove_listener("A"));
    assert!(registry.is_transport_open());

    assert!(registry.remove_listener(" B "));
    assert!(!registry.is_transport_open());
    assert_eq!(*registry.connection_state().borrow(), ConnectionState::Disconnected);

    settle().await;
    assert_eq!(mock.live_links(), 0);

    // Idempotent.
    assert!(!registry.remove_listener("B"));
}

#[tokio::test(start_paused = true)]
async fn immediate_close_spares_link_when_listener_arrives_first() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, immediate_close());

    registry.add_listener(ListenerRegistration::new("A", |_| {}));
    settle().await;

    // remove_listener saw an empty table, then a new registration landed
    // before the close ran.
    registry.shared().schedule_close();

    assert!(registry.is_transport_open());
    assert_eq!(*registry.connection_state().borrow(), ConnectionState::Connected);
    settle().await;
    assert_eq!(mock.live_links(), 1);
    assert_eq!(mock.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn linger_absorbs_remount() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());

    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    settle().await;
    registry.remove_listener("SN123");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(registry.is_transport_open());
    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));

    // The original linger would have fired by now.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(registry.is_transport_open());
    assert_eq!(mock.attempts().len(), 1);

    registry.remove_listener("SN123");
    tokio::time::sleep(Duration::from_millis(1_900)).await;
    assert!(registry.is_transport_open());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!registry.is_transport_open());
    assert_eq!(mock.live_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_registry_closes_link() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    drop(registry);
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    settle().await;
    assert_eq!(mock.live_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_registry_cancels_pending_backoff() {
    let mock = MockConnector::scripted([Step::Refuse]);
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Reconnecting { attempt: 1 }).await;

    drop(registry);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(mock.attempts().len(), 1);
}

// ── Reconnect policy ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_and_resets_after_success() {
    // Initial accept, two refusals, then accepts forever.
    let mock = MockConnector::scripted([Step::Accept, Step::Refuse, Step::Refuse, Step::Accept]);
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let dropped_at = Instant::now();
    mock.drop_links();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let attempts = mock.attempts();
    assert_eq!(attempts.len(), 4);
    assert_near(attempts[1] - dropped_at, Duration::from_secs(1));
    assert_near(attempts[2] - attempts[1], Duration::from_secs(2));
    assert_near(attempts[3] - attempts[2], Duration::from_secs(4));
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    // Backoff starts over after the successful reconnect.
    let dropped_again = Instant::now();
    mock.drop_links();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let attempts = mock.attempts();
    assert_eq!(attempts.len(), 5);
    assert_near(attempts[4] - dropped_again, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_reported_on_error_topic() {
    let mock = MockConnector::scripted([Step::Refuse; 3]);
    let config = RegistryConfig {
        reconnect: ReconnectConfig {
            max_retries: Some(3),
            ..ReconnectConfig::default()
        },
        ..RegistryConfig::default()
    };
    let (registry, bus) = registry_with(&mock, config);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    bus.subscribe(Topic::TRANSPORT_ERROR, move |event: &Event| {
        sink.lock().unwrap().push(event.payload.clone());
    });

    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(mock.attempts().len(), 3);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["attempts"], json!(3));
    assert!(errors[0]["error"].as_str().unwrap().contains("connection refused"));

    assert!(!registry.is_transport_open());
    assert!(registry.has_listener("SN123"));
}

#[tokio::test(start_paused = true)]
async fn fatal_error_fails_immediately_and_next_registration_retries() {
    let mock = MockConnector::scripted([Step::Reject]);
    let (registry, bus) = registry_with(&mock, RegistryConfig::default());

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    bus.subscribe(Topic::TRANSPORT_ERROR, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    let mut state = registry.connection_state();
    wait_for_state(&mut state, ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(mock.attempts().len(), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    registry.add_listener(ListenerRegistration::new("SN123", |_| {}));
    wait_for_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(mock.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_is_announced_to_bus_and_interested_listeners() {
    let mock = MockConnector::default();
    let (registry, bus) = registry_with(&mock, RegistryConfig::default());

    let announcements = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&announcements);
    bus.subscribe(Topic::TRANSPORT_CONNECTED, move |event: &Event| {
        sink.lock().unwrap().push(event.payload["reconnected"].clone());
    });

    let (interested, seen) = recording(
        "SN123",
        &[Topic::DEVICE_CONNECTION, Topic::TRANSPORT_CONNECTED],
    );
    let (indifferent, indifferent_seen) = recording("SN456", &[Topic::DEVICE_CONNECTION]);
    registry.add_listener(interested);
    registry.add_listener(indifferent);
    settle().await;

    assert_eq!(*announcements.lock().unwrap(), vec![json!(false)]);
    assert!(seen.lock().unwrap().is_empty());

    mock.drop_links();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(*announcements.lock().unwrap(), vec![json!(false), json!(true)]);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, Topic::TRANSPORT_CONNECTED);
        assert_eq!(seen[0].device_id.as_ref().unwrap().as_str(), "SN123");
    }
    assert!(indifferent_seen.lock().unwrap().is_empty());

    // An explicit reconnect counts too.
    registry.reconnect();
    settle().await;
    assert_eq!(announcements.lock().unwrap().len(), 3);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(mock.live_links(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_registrations_for_next_link() {
    let mock = MockConnector::default();
    let (registry, _bus) = registry_with(&mock, RegistryConfig::default());
    let (registration, seen) = recording("SN123", &[Topic::DEVICE_STATISTICS]);
    registry.add_listener(registration);
    settle().await;

    registry.shutdown();
    settle().await;
    assert!(!registry.is_transport_open());
    assert_eq!(mock.live_links(), 0);
    assert!(registry.has_listener("SN123"));

    registry.reconnect();
    settle().await;
    mock.emit("SN123", Topic::DEVICE_STATISTICS, json!({}));
    settle().await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}
