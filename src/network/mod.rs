//! Network subsystem: stream transport and connection supervision

pub mod backoff;
pub mod supervisor;
pub mod transport;
pub mod websocket;

pub use backoff::Backoff;
pub use supervisor::{AudioPath, ConnectionSupervisor, ReceiverHandle};
pub use transport::{Connection, Connector};
pub use websocket::WsConnector;
