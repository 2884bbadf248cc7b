// Realtime delivery-status sync: one WebSocket, many topic subscribers.
// The transport sits behind the `Connector` trait so the reconnect state
// machine can be driven by scripted connections in tests.

pub mod manager;
pub mod registry;
pub mod transport;

pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use registry::{Subscription, SubscriptionId};
pub use transport::{CloseInfo, Connector, WsConnector};
