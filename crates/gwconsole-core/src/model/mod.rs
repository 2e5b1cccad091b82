// ── Shared notification types ──
//
// Identity, topic, and event types that flow between the transport, the
// registry, the bus, and consumers.

pub mod device_id;
pub mod event;
pub mod topic;

pub use device_id::DeviceId;
pub use event::Event;
pub use topic::Topic;
