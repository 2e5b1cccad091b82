// ── Event ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gwconsole_api::InboundMessage;

use super::{DeviceId, Topic};

/// Something that happened, addressed by topic.
///
/// Produced by the transport or by in-process triggers. Events are shared
/// behind `Arc` during fan-out and never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,

    /// Device the event is about; `None` for process-wide events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,

    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// A process-wide event stamped with the current time.
    pub fn new(topic: impl Into<Topic>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            device_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// An event about one device, stamped with the current time.
    pub fn for_device(
        device_id: impl Into<DeviceId>,
        topic: impl Into<Topic>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::new(topic, payload)
        }
    }
}

impl From<InboundMessage> for Event {
    fn from(msg: InboundMessage) -> Self {
        Self {
            topic: Topic::from(msg.topic),
            device_id: Some(DeviceId::new(msg.device_id)),
            payload: msg.payload,
            timestamp: msg.received_at,
        }
    }
}
