//! Connection and error events surfaced to the embedding application

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// Kind of connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Connect => "connect",
            EventType::Disconnect => "disconnect",
            EventType::Subscribe => "subscribe",
            EventType::Unsubscribe => "unsubscribe",
        };
        f.write_str(s)
    }
}

/// Observational record of a registry change. Not authoritative state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub event_type: EventType,
    /// Identity of the connection (the `user_id` it registered with)
    pub connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(event_type: EventType, connection_id: impl Into<String>) -> Self {
        Self {
            event_type,
            connection_id: connection_id.into(),
            topic: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Error codes carried by [`ErrorEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Topic envelope could not be serialized
    Serialization,
    /// Transport upgrade failed
    UpgradeFailed,
    /// Reading from a connection failed
    ReadFailed,
    /// Writing to a connection failed
    WriteFailed,
    /// Heartbeat could not be delivered
    HeartbeatFailed,
    /// Peer did not answer heartbeats in time
    HeartbeatTimeout,
    /// Upgrade request was rejected by the auth predicate
    AuthFailed,
    /// Registration refused because the identity is already live
    DuplicateIdentity,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Serialization => 1001,
            ErrorCode::UpgradeFailed => 1002,
            ErrorCode::ReadFailed => 1003,
            ErrorCode::WriteFailed => 1004,
            ErrorCode::HeartbeatFailed => 1005,
            ErrorCode::HeartbeatTimeout => 1006,
            ErrorCode::AuthFailed => 1007,
            ErrorCode::DuplicateIdentity => 1008,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A per-connection or hub-level failure reported to the application
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            connection_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}
