//! Hub configuration

use bytes::Bytes;
use std::time::Duration;

/// Default literal written by [`HeartbeatMode::Payload`]
pub const DEFAULT_HEARTBEAT_PAYLOAD: &str = "heartbeat";

/// Default payload a client sends to acknowledge a heartbeat
pub const DEFAULT_HEARTBEAT_ACK: &str = "heartbeat_ack";

/// Default notice broadcast to every client when the hub shuts down
pub const DEFAULT_SHUTDOWN_NOTICE: &str = "Server is shutting down";

/// Liveness probing strategy, one per hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// No liveness enforcement; dead peers are only noticed on read/write errors
    Disabled,
    /// Send ping control frames and expect pongs within `timeout`
    Ping { interval: Duration, timeout: Duration },
    /// Write a literal payload and close after `max_failures` consecutive write errors
    Payload {
        interval: Duration,
        max_failures: u32,
        payload: Bytes,
    },
}

impl HeartbeatMode {
    /// Protocol-level ping/pong check
    pub fn ping(interval: Duration, timeout: Duration) -> Self {
        HeartbeatMode::Ping { interval, timeout }
    }

    /// Application-level heartbeat using the default heartbeat literal
    pub fn payload(interval: Duration, max_failures: u32) -> Self {
        HeartbeatMode::Payload {
            interval,
            max_failures,
            payload: Bytes::from_static(DEFAULT_HEARTBEAT_PAYLOAD.as_bytes()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, HeartbeatMode::Disabled)
    }
}

impl Default for HeartbeatMode {
    fn default() -> Self {
        HeartbeatMode::ping(Duration::from_secs(30), Duration::from_secs(60))
    }
}

/// What to do when a connection registers with an identity that is already live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Close the existing connection and register the new one
    Replace,
    /// Refuse the new connection
    Reject,
    /// Keep both connections live under the same identity
    #[default]
    Coexist,
}

/// Whether topics with no subscribers stay in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicRetention {
    /// Empty topics remain listed
    #[default]
    Keep,
    /// A topic is removed as soon as its last subscriber leaves
    Prune,
}

/// Configuration for a [`Hub`](crate::server::Hub)
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,

    /// Capacity of the hub's command queue
    pub command_capacity: usize,

    /// Capacity of the connection and error event streams
    pub event_capacity: usize,

    /// Liveness probing strategy
    pub heartbeat: HeartbeatMode,

    /// Inbound payload treated as a heartbeat acknowledgement and never broadcast
    pub heartbeat_ack: Bytes,

    /// Handling of identity collisions on register
    pub duplicate_policy: DuplicatePolicy,

    /// Handling of topics whose last subscriber left
    pub topic_retention: TopicRetention,

    /// Payload broadcast to all clients on shutdown
    pub shutdown_notice: Bytes,

    /// Whether client messages are also delivered back to their sender
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            command_capacity: 1024,
            event_capacity: 100,
            heartbeat: HeartbeatMode::default(),
            heartbeat_ack: Bytes::from_static(DEFAULT_HEARTBEAT_ACK.as_bytes()),
            duplicate_policy: DuplicatePolicy::default(),
            topic_retention: TopicRetention::default(),
            shutdown_notice: Bytes::from_static(DEFAULT_SHUTDOWN_NOTICE.as_bytes()),
            echo_to_sender: false,
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-connection outbound queue capacity
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the event stream capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set the heartbeat strategy
    pub fn heartbeat(mut self, mode: HeartbeatMode) -> Self {
        self.heartbeat = mode;
        self
    }

    /// Disable heartbeats entirely
    pub fn no_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatMode::Disabled;
        self
    }

    /// Set the heartbeat acknowledgement payload
    pub fn heartbeat_ack(mut self, ack: impl Into<Bytes>) -> Self {
        self.heartbeat_ack = ack.into();
        self
    }

    /// Set the duplicate identity policy
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Set the empty topic policy
    pub fn topic_retention(mut self, retention: TopicRetention) -> Self {
        self.topic_retention = retention;
        self
    }

    /// Set the shutdown notice
    pub fn shutdown_notice(mut self, notice: impl Into<Bytes>) -> Self {
        self.shutdown_notice = notice.into();
        self
    }

    /// Deliver client messages back to their sender too
    pub fn echo_to_sender(mut self, echo: bool) -> Self {
        self.echo_to_sender = echo;
        self
    }
}
