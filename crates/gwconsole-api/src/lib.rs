// gwconsole-api: Transport boundary for the gateway (notification WebSocket + REST)

pub mod error;
pub mod gateway;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use gateway::{CommandStatus, DeviceStatus, GatewayClient};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{Connector, InboundMessage, MessageStream, WebSocketConnector};
