//! Network Layer
//!
//! Transport-agnostic connection handling. The [`ConnectionManager`] owns the
//! session lifecycle; transports only move text frames.

pub mod protocol;
pub mod transport;
pub mod websocket;
pub mod connection;

pub use protocol::{Envelope, EventPayload, ProtocolError, message_types};
pub use transport::{
    MemoryHub, MemoryTransport, Transport, TransportError, TransportEvent, TransportFactory,
    TransportRegistry, MEMORY, WEBSOCKET,
};
pub use websocket::WebSocketTransport;
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionStats, MessagePriority, OutboundMessage,
};
