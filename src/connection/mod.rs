//! Real-time push channel: wire protocol, state machine, transport, manager.

pub mod manager;
pub mod protocol;
pub mod state;
pub mod transport;

pub use manager::{ConnectionManager, ConnectionStats};
pub use protocol::{ControlMessage, InboundMessage, MessageKind, Topic};
pub use state::{Backoff, ConnectionSnapshot, ConnectionState};
pub use transport::{Transport, WebSocketTransport, NORMAL_CLOSURE};
