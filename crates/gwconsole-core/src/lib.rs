// gwconsole-core: Device event notification layer between gwconsole-api and consumers.

pub mod bus;
pub mod error;
pub mod model;
pub mod poll;
pub mod registry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bus::{EventBus, SubscriptionHandle, SubscriptionId};
pub use error::CoreError;
pub use poll::{PollAttempt, PollOptions, PollOutcome, PollSnapshot, PollState, PollingWatcher};
pub use registry::{
    ConnectionState, DeviceEventRegistry, ListenerRegistration, ReconnectConfig, RegistryConfig,
};

pub use model::{DeviceId, Event, Topic};
