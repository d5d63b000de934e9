//! Connection state and the bounded outbound queue

use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique id of one registered connection. Distinct from the user identity,
/// which several connections may share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a non-blocking offer was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OfferError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

/// Producer side of a connection's outbound queue.
///
/// Only the hub holds this; dropping it closes the queue, which is the
/// signal for the connection's outbound pump to send a close frame and exit.
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
}

/// Consumer side of a connection's outbound queue, drained by the outbound pump
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Bytes>,
}

/// Create a bounded outbound queue
pub fn outbound_queue(capacity: usize) -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundQueue { tx }, OutboundReceiver { rx })
}

impl OutboundQueue {
    /// Enqueue without waiting
    pub fn offer(&self, payload: Bytes) -> Result<(), OfferError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OfferError::Full,
            mpsc::error::TrySendError::Closed(_) => OfferError::Closed,
        })
    }
}

impl OutboundReceiver {
    /// Next payload, or `None` once the queue is closed and drained
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking receive, mostly useful for inspecting queues in tests
    pub fn try_recv(&mut self) -> Result<Bytes, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// A client session as handed to the hub for registration
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    outbound: OutboundQueue,
    closer: CancellationToken,
}

impl Connection {
    /// Create a connection with a fresh id. An empty or missing `user_id`
    /// is replaced with a generated identity.
    pub fn new(user_id: Option<String>, capacity: usize) -> (Self, OutboundReceiver) {
        let user_id = user_id
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (outbound, rx) = outbound_queue(capacity);

        let conn = Self {
            id: ConnectionId::new(),
            user_id,
            outbound,
            closer: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Token cancelled when the connection's transport must be closed
    pub fn close_signal(&self) -> CancellationToken {
        self.closer.clone()
    }

    pub(crate) fn offer(&self, payload: Bytes) -> Result<(), OfferError> {
        self.outbound.offer(payload)
    }

    /// Signal the transport to close. The outbound queue closes when the
    /// hub drops this value.
    pub(crate) fn close_transport(&self) {
        self.closer.cancel();
    }
}
