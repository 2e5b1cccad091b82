//! Named-topic publish/subscribe.
//!
//! [`EventBus`] is pure mechanism: it knows nothing about devices, holds no
//! business state, and only invokes callbacks. It is an injectable service;
//! construct one, hand clones to whoever needs it, and tests get their own
//! isolated instance.
//!
//! Delivery is synchronous and in subscription order. Callbacks run outside
//! the bus lock, so a callback may subscribe, unsubscribe, or publish
//! without deadlocking. A callback that panics is logged and skipped; the
//! publisher and the remaining subscribers are unaffected.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{trace, warn};

use crate::model::{Event, Topic};

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Unique id of one subscription within a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to stop delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Process-wide publish/subscribe primitive. Cheaply cloneable.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`. Several subscribers per topic are
    /// allowed and independent.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        self.topics()
            .entry(topic.clone())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        trace!(%topic, id = id.0, "subscribed");
        SubscriptionHandle { topic, id }
    }

    /// Remove a subscription. Idempotent: returns `false` if the handle was
    /// already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(&handle.topic) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != handle.id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            topics.remove(&handle.topic);
        }
        removed
    }

    /// Publish `payload` under `topic`. Returns the number of callbacks
    /// that completed without panicking.
    pub fn publish(&self, topic: impl Into<Topic>, payload: serde_json::Value) -> usize {
        self.publish_event(&Event::new(topic, payload))
    }

    /// Deliver a pre-built event to every current subscriber of its topic.
    ///
    /// Subscribers added while delivery is in progress do not see this event.
    pub fn publish_event(&self, event: &Event) -> usize {
        let callbacks: Vec<Callback> = self
            .topics()
            .get(&event.topic)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
            .unwrap_or_default();

        trace!(topic = %event.topic, subscribers = callbacks.len(), "publishing");

        let mut delivered = 0;
        for callback in &callbacks {
            if invoke_isolated(&**callback, event) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics().get(topic).map_or(0, Vec::len)
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, Vec<Subscriber>>> {
        // Callbacks never run under this lock, so poisoning can only come
        // from a panic in the bookkeeping above; the map is still coherent.
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topics().len())
            .finish_non_exhaustive()
    }
}

// ── Callback isolation ───────────────────────────────────────────────

/// Run a consumer callback, containing any panic it raises.
///
/// Returns `true` if the callback returned normally.
pub(crate) fn invoke_isolated(callback: &(dyn Fn(&Event) + Send + Sync), event: &Event) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(()) => true,
        Err(cause) => {
            warn!(
                topic = %event.topic,
                device = ?event.device_id,
                panic = panic_message(cause.as_ref()),
                "event callback panicked"
            );
            false
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = {
            let log = Arc::clone(&log);
            move |name: &str| -> Callback {
                let log = Arc::clone(&log);
                let name = name.to_owned();
                Arc::new(move |event: &Event| {
                    log.lock()
                        .unwrap()
                        .push(format!("{name}:{}", event.payload["n"]));
                })
            }
        };
        (log, log_for)
    }

    #[test]
    fn publish_reaches_only_matching_topic_in_order() {
        let bus = EventBus::new();
        let (log, cb) = recorder();

        let a = cb("a");
        let b = cb("b");
        let other = cb("other");
        bus.subscribe("action_completed", move |e| a(e));
        bus.subscribe("action_completed", move |e| b(e));
        bus.subscribe("refresh_interface_statistics", move |e| other(e));

        let delivered = bus.publish(Topic::ACTION_COMPLETED, json!({ "n": 1 }));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody_listens", json!(null)), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let (log, cb) = recorder();
        let a = cb("a");
        let handle = bus.subscribe("t", move |e| a(e));

        assert!(bus.unsubscribe(&handle));
        assert!(!bus.unsubscribe(&handle));
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.publish("t", json!({ "n": 1 }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_leaves_siblings_alone() {
        let bus = EventBus::new();
        let (log, cb) = recorder();
        let a = cb("a");
        let b = cb("b");
        let first = bus.subscribe("t", move |e| a(e));
        bus.subscribe("t", move |e| b(e));

        bus.unsubscribe(&first);
        bus.publish("t", json!({ "n": 7 }));

        assert_eq!(*log.lock().unwrap(), vec!["b:7"]);
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let bus = EventBus::new();
        let (log, cb) = recorder();
        let after = cb("after");

        bus.subscribe("t", |_| panic!("consumer blew up"));
        bus.subscribe("t", move |e| after(e));

        let delivered = bus.publish("t", json!({ "n": 3 }));

        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after:3"]);
    }

    #[test]
    fn subscriber_added_during_publish_misses_that_event() {
        let bus = EventBus::new();
        let (log, cb) = recorder();

        let late = cb("late");
        let late = Arc::new(late);
        let inner_bus = bus.clone();
        bus.subscribe("t", move |_| {
            let late = Arc::clone(&late);
            inner_bus.subscribe("t", move |e| late(e));
        });

        bus.publish("t", json!({ "n": 1 }));
        assert!(log.lock().unwrap().is_empty());

        bus.publish("t", json!({ "n": 2 }));
        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn clones_share_subscriptions() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let (log, cb) = recorder();
        let a = cb("a");
        clone.subscribe("t", move |e| a(e));

        bus.publish("t", json!({ "n": 5 }));
        assert_eq!(*log.lock().unwrap(), vec!["a:5"]);
    }

    #[test]
    fn separate_buses_are_isolated() {
        let first = EventBus::new();
        let second = EventBus::new();
        first.subscribe("t", |_| {});

        assert_eq!(first.subscriber_count("t"), 1);
        assert_eq!(second.subscriber_count("t"), 0);
    }
}
