// ── Listener registrations ──

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bus::invoke_isolated;
use crate::model::{DeviceId, Event, Topic};

/// Consumer callback invoked for matching device events.
pub type TriggerFn = Arc<dyn Fn(&Event) + Send + Sync>;

/// A consumer's interest in one device.
///
/// ```rust,ignore
/// registry.add_listener(
///     ListenerRegistration::new("24f5a2e1b0c4", move |_event| refresh())
///         .topics(Topic::device_lifecycle()),
/// );
/// ```
#[derive(Clone)]
pub struct ListenerRegistration {
    device_id: DeviceId,
    topics: HashSet<Topic>,
    on_trigger: TriggerFn,
}

impl ListenerRegistration {
    /// A registration with no topics yet; add them with [`topic`](Self::topic)
    /// or [`topics`](Self::topics).
    pub fn new<F>(device_id: impl Into<DeviceId>, on_trigger: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            device_id: device_id.into(),
            topics: HashSet::new(),
            on_trigger: Arc::new(on_trigger),
        }
    }

    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn interested_topics(&self) -> &HashSet<Topic> {
        &self.topics
    }

    pub fn is_interested_in(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("device_id", &self.device_id)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// A registration as held by the registry.
///
/// `active` flips to `false` when the registration is replaced or removed,
/// so a dispatch that already fetched it never fires a stale callback.
pub(crate) struct Listener {
    registration: ListenerRegistration,
    active: AtomicBool,
}

impl Listener {
    pub(crate) fn new(registration: ListenerRegistration) -> Self {
        Self {
            registration,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn registration(&self) -> &ListenerRegistration {
        &self.registration
    }

    pub(crate) fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Invoke the callback if still active. Panics are contained.
    pub(crate) fn trigger(&self, event: &Event) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        invoke_isolated(&*self.registration.on_trigger, event)
    }
}
