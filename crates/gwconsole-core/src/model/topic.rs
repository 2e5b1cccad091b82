// ── Topics ──
//
// A topic names a category of event. Device notification kinds come from
// the gateway; the rest are raised inside the process.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque event category, compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    // ── Device notification kinds (pushed by the gateway) ────────────

    pub const DEVICE_CONNECTION: &'static str = "device_connection";
    pub const DEVICE_DISCONNECTION: &'static str = "device_disconnection";
    pub const DEVICE_FIRMWARE_UPGRADE: &'static str = "device_firmware_upgrade";
    pub const DEVICE_STATISTICS: &'static str = "device_statistics";
    pub const COMMAND_COMPLETED: &'static str = "command_completed";

    // ── In-process topics ────────────────────────────────────────────

    /// A command form finished talking to the gateway.
    pub const ACTION_COMPLETED: &'static str = "action_completed";
    /// Manual refresh of the interface statistics view.
    pub const REFRESH_INTERFACE_STATISTICS: &'static str = "refresh_interface_statistics";
    /// The notification link failed for good (retries exhausted or fatal error).
    pub const TRANSPORT_ERROR: &'static str = "transport_error";
    /// A notification link was (re-)established; cached state may be stale.
    pub const TRANSPORT_CONNECTED: &'static str = "transport_connected";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The device notification kinds a device detail view usually follows.
    pub fn device_lifecycle() -> [Topic; 4] {
        [
            Topic::from(Self::DEVICE_CONNECTION),
            Topic::from(Self::DEVICE_DISCONNECTION),
            Topic::from(Self::DEVICE_FIRMWARE_UPGRADE),
            Topic::from(Self::DEVICE_STATISTICS),
        ]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Topic {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Topic {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
