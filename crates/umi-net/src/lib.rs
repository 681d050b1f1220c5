// Broker connectivity: STOMP sessions over a pluggable text transport.

pub mod error;
pub mod manager;
pub mod memory;
pub mod presence;
pub mod transport;

pub use error::NetError;
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionStatus, Delivery, Handler};
pub use memory::{memory_transport, BrokerEnd, MemoryBroker, MemoryConnector};
pub use presence::PresenceTracker;
pub use transport::{Connector, Link, WsConnector};
