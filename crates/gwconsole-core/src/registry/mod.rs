// ── Device event registry ──
//
// Maps gateway notifications to the consumers that care about them, and
// keeps the notification link open exactly while someone is listening.
// One listener per device (last registration wins); one link per registry,
// opened on the first registration and closed a short linger after the
// last one goes away.

mod backoff;
mod listener;
mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use gwconsole_api::Connector;

use crate::bus::EventBus;
use crate::error::CoreError;
use crate::model::{DeviceId, Event, Topic};

pub use backoff::ReconnectConfig;
pub use listener::{ListenerRegistration, TriggerFn};

use listener::Listener;

// ── ConnectionState ──────────────────────────────────────────────

/// State of the notification link, observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted or a fatal error; details went to the error topic.
    Failed,
}

// ── RegistryConfig ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub reconnect: ReconnectConfig,

    /// How long the link stays up after the last listener is removed.
    /// Absorbs unmount/remount pairs during navigation. Zero closes
    /// the link synchronously inside `remove_listener`.
    pub linger: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            linger: Duration::from_secs(2),
        }
    }
}

// ── DeviceEventRegistry ──────────────────────────────────────────

/// Fans gateway notifications out to per-device listeners.
///
/// Cheaply cloneable. Dropping the last clone (or calling
/// [`shutdown`](Self::shutdown)) closes the link and cancels every timer the
/// registry owns. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct DeviceEventRegistry {
    inner: Arc<RegistryHandle>,
}

struct RegistryHandle {
    shared: Arc<Shared>,
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        self.shared.close_link("registry dropped");
    }
}

impl DeviceEventRegistry {
    /// Create a registry. No link is opened until the first listener
    /// registers. Errors are published on `bus` under
    /// [`Topic::TRANSPORT_ERROR`].
    pub fn new<C: Connector>(connector: C, bus: EventBus, config: RegistryConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(RegistryHandle {
                shared: Arc::new(Shared {
                    connector: Arc::new(connector),
                    bus,
                    config,
                    listeners: DashMap::new(),
                    state,
                    link: Mutex::new(Link::default()),
                    next_session: AtomicU64::new(1),
                }),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Install or replace the registration for its device, opening the
    /// link if none is up.
    pub fn add_listener(&self, registration: ListenerRegistration) {
        let shared = self.shared();
        let device_id = registration.device_id().clone();
        let topics = registration.interested_topics().len();

        let listener = Arc::new(Listener::new(registration));
        match shared.listeners.insert(device_id.clone(), listener) {
            Some(previous) => {
                previous.retire();
                debug!(device = %device_id, topics, "replaced existing listener");
            }
            None => debug!(device = %device_id, topics, "listener added"),
        }

        shared.ensure_link();
    }

    /// Remove the registration for `device_id` if present. Idempotent;
    /// returns whether a registration was removed.
    pub fn remove_listener(&self, device_id: impl AsRef<str>) -> bool {
        let shared = self.shared();
        let key = device_id.as_ref().trim();

        let removed = shared.listeners.remove(key).map(|(_, listener)| listener);
        if let Some(listener) = &removed {
            listener.retire();
            debug!(device = key, "listener removed");
        }

        if shared.listeners.is_empty() {
            shared.schedule_close();
        }
        removed.is_some()
    }

    /// Drop the current link and reconnect immediately, if anyone is
    /// listening. Consumers should re-fetch state once
    /// [`Topic::TRANSPORT_CONNECTED`] fires.
    pub fn reconnect(&self) {
        let shared = self.shared();
        let mut link = shared.link();
        if shared.listeners.is_empty() {
            shared.close_session(&mut link, "reconnect with no listeners");
            return;
        }

        let resumed = match link.session.take() {
            Some(session) => {
                session.cancel.cancel();
                info!(session = session.id, "reconnect requested");
                true
            }
            None => false,
        };
        shared.spawn_session(&mut link, resumed);
    }

    /// Close the link and cancel pending timers. Registrations stay in
    /// place; the next `add_listener` opens a fresh link.
    pub fn shutdown(&self) {
        self.shared().close_link("shutdown requested");
    }

    // ── Observation ──────────────────────────────────────────────

    /// Subscribe to link state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state.subscribe()
    }

    /// `true` while the registry holds a link (open, connecting, or
    /// backing off between attempts).
    pub fn is_transport_open(&self) -> bool {
        self.shared().link().session.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.shared().listeners.len()
    }

    pub fn has_listener(&self, device_id: impl AsRef<str>) -> bool {
        self.shared()
            .listeners
            .contains_key(device_id.as_ref().trim())
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// State shared between the registry handles and the session task.
struct Shared {
    connector: Arc<dyn Connector>,
    bus: EventBus,
    config: RegistryConfig,
    listeners: DashMap<DeviceId, Arc<Listener>>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    next_session: AtomicU64,
}

/// Ownership of the live link. Only one session exists at a time.
#[derive(Default)]
struct Link {
    session: Option<Session>,
    linger: Option<CancellationToken>,
}

struct Session {
    id: u64,
    cancel: CancellationToken,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        // Never held across a callback or an await.
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_link(self: &Arc<Self>) {
        let mut link = self.link();
        if let Some(linger) = link.linger.take() {
            linger.cancel();
            debug!("pending link close cancelled");
        }
        if link.session.is_none() {
            self.spawn_session(&mut link, false);
        }
    }

    /// `resumed` marks a replacement for a link that was already open, so
    /// the first successful connect is announced as a reconnect.
    fn spawn_session(self: &Arc<Self>, link: &mut Link, resumed: bool) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        link.session = Some(Session {
            id,
            cancel: cancel.clone(),
        });
        self.state.send_replace(ConnectionState::Connecting);

        debug!(session = id, "opening notification link");
        tokio::spawn(session::run(Arc::clone(self), id, cancel, resumed));
    }

    /// Called when the listener table becomes empty.
    fn schedule_close(self: &Arc<Self>) {
        let mut link = self.link();
        if link.session.is_none() || link.linger.is_some() {
            return;
        }
        // A concurrent add_listener may have landed since the caller saw
        // the table empty; it holds this lock to reuse the session.
        if !self.listeners.is_empty() {
            return;
        }

        if self.config.linger.is_zero() {
            self.close_session(&mut link, "no listeners left");
            return;
        }

        let token = CancellationToken::new();
        link.linger = Some(token.clone());
        drop(link);

        let shared = Arc::clone(self);
        let linger = self.config.linger;
        trace!(linger_ms = linger.as_millis(), "scheduling link close");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(linger) => shared.close_if_idle(&token),
            }
        });
    }

    fn close_if_idle(&self, token: &CancellationToken) {
        let mut link = self.link();
        // A newer add_listener cancelled this timer under the same lock.
        if token.is_cancelled() {
            return;
        }
        link.linger = None;
        if self.listeners.is_empty() {
            self.close_session(&mut link, "no listeners left");
        }
    }

    fn close_link(&self, reason: &str) {
        let mut link = self.link();
        self.close_session(&mut link, reason);
    }

    fn close_session(&self, link: &mut Link, reason: &str) {
        if let Some(linger) = link.linger.take() {
            linger.cancel();
        }
        if let Some(session) = link.session.take() {
            session.cancel.cancel();
            self.state.send_replace(ConnectionState::Disconnected);
            info!(session = session.id, reason, "notification link closed");
        }
    }

    // ── Called from the session task ─────────────────────────────

    /// Publish a state change on behalf of session `id`. Ignored once the
    /// session has been replaced or closed.
    fn publish_state(&self, id: u64, state: ConnectionState) -> bool {
        let link = self.link();
        let current = link
            .session
            .as_ref()
            .is_some_and(|s| s.id == id && !s.cancel.is_cancelled());
        if current {
            self.state.send_replace(state);
        }
        current
    }

    /// End session `id` with `final_state`. Returns `false` if it was no
    /// longer the current session.
    fn end_session(&self, id: u64, final_state: ConnectionState) -> bool {
        let mut link = self.link();
        if !link.session.as_ref().is_some_and(|s| s.id == id) {
            return false;
        }
        link.session = None;
        if let Some(linger) = link.linger.take() {
            linger.cancel();
        }
        self.state.send_replace(final_state);
        true
    }

    /// End session `id` if nobody is listening any more. Checked under the
    /// link lock so a concurrent `add_listener` either keeps this session
    /// alive or opens a new one.
    fn end_if_idle(&self, id: u64) -> bool {
        let mut link = self.link();
        if !self.listeners.is_empty() {
            return false;
        }
        if link.session.as_ref().is_some_and(|s| s.id == id) {
            link.session = None;
            if let Some(linger) = link.linger.take() {
                linger.cancel();
            }
            self.state.send_replace(ConnectionState::Disconnected);
        }
        true
    }

    /// Tear down session `id` for good and report on the error topic.
    fn fail(&self, id: u64, error: &CoreError, attempts: u32) {
        if self.end_session(id, ConnectionState::Failed) {
            self.bus.publish(
                Topic::TRANSPORT_ERROR,
                json!({ "error": error.to_string(), "attempts": attempts }),
            );
        }
    }

    /// Deliver one inbound event to its device's listener, if interested.
    fn dispatch(&self, event: &Event) {
        let Some(device_id) = &event.device_id else {
            return;
        };

        // Clone out of the map so the shard lock is released before the
        // callback runs; callbacks may add or remove listeners.
        let listener = self
            .listeners
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()));

        let Some(listener) = listener else {
            trace!(device = %device_id, topic = %event.topic, "no listener for device");
            return;
        };

        if !listener.registration().is_interested_in(&event.topic) {
            trace!(device = %device_id, topic = %event.topic, "topic not of interest");
            return;
        }

        listener.trigger(event);
    }

    /// Tell everyone a link is up. After a reconnect, listeners that asked
    /// for [`Topic::TRANSPORT_CONNECTED`] get it too, so they can re-fetch
    /// whatever they missed while the link was down.
    fn announce_connected(&self, reconnected: bool) {
        let event = Event::new(
            Topic::TRANSPORT_CONNECTED,
            json!({ "reconnected": reconnected }),
        );
        self.bus.publish_event(&event);

        if !reconnected {
            return;
        }

        let interested: Vec<Arc<Listener>> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().registration().is_interested_in(&event.topic))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for listener in interested {
            let device_event = Event {
                device_id: Some(listener.registration().device_id().clone()),
                ..event.clone()
            };
            listener.trigger(&device_event);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests;
