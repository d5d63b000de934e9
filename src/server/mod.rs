//! Hub server implementation
//!
//! Connection registry, topic routing, per-connection pumps and heartbeat,
//! and the WebSocket entry point.

mod connections;
mod heartbeat;
mod hub;
mod pumps;
mod topics;
pub mod transport;
pub mod websocket;

pub use connections::{outbound_queue, Connection, ConnectionId, OfferError, OutboundQueue, OutboundReceiver};
pub use hub::{Hub, HubState};
pub use pumps::{classify, InboundCommand};
pub use topics::{TopicEnvelope, TopicRegistry};
pub use transport::{memory_transport, Frame, FrameReader, FrameWriter, MemoryPeer, TransportError};
pub use websocket::{create_router, run_websocket_server, AuthPredicate, UpgradeRequest, UpgradeSettings, WsState};
