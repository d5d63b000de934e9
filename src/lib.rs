//! Tankws - WebSocket connection hub
//!
//! Keeps the registry of live client connections, routes topic subscriptions,
//! fans messages out without letting a slow client stall the rest, checks
//! liveness with heartbeats and drains everything on shutdown.

pub mod config;
pub mod error;
pub mod events;
pub mod server;

pub use config::{DuplicatePolicy, HeartbeatMode, HubConfig, TopicRetention};
pub use error::{HubError, Result};
pub use events::{ConnectionEvent, ErrorCode, ErrorEvent, EventType};
pub use server::{Connection, ConnectionId, Hub, HubState};
