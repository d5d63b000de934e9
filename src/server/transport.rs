//! Frame transport seam
//!
//! The hub never talks to a socket directly. A transport is split into a
//! [`FrameReader`] owned by the inbound pump and a [`FrameWriter`] shared by
//! the outbound pump and the heartbeat monitor. The WebSocket adapter lives in
//! [`crate::server::websocket`]; an in-memory loopback is provided here.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away (page navigation, server restart)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One discrete message on the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<u16>),
}

impl Frame {
    /// Data frame for an outbound payload: text when it is valid UTF-8
    pub fn from_payload(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(text) => Frame::Text(text.to_string()),
            Err(_) => Frame::Binary(payload),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed (code {code:?})")]
    Closed { code: Option<u16> },

    #[error("transport error: {0}")]
    Io(String),
}

impl TransportError {
    /// Closures that are part of a normal session end and are not reported
    pub fn is_expected_close(&self) -> bool {
        match self {
            TransportError::Closed { code: None } => true,
            TransportError::Closed { code: Some(code) } => {
                matches!(*code, CLOSE_NORMAL | CLOSE_GOING_AWAY | CLOSE_ABNORMAL)
            }
            TransportError::Io(_) => false,
        }
    }
}

/// Read half of a transport
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next frame, `Ok(None)` once the stream has ended
    async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Write half of a transport
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError>;
}

/// Create an in-memory transport. The reader and writer are handed to the hub,
/// the peer plays the remote client.
pub fn memory_transport() -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (to_server, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_server) = mpsc::unbounded_channel();
    let faults = Arc::new(WriteFaults::default());

    let reader = MemoryReader { rx: from_peer };
    let writer = MemoryWriter {
        tx: to_peer,
        faults: faults.clone(),
    };
    let peer = MemoryPeer {
        tx: Some(to_server),
        rx: from_server,
        faults,
    };
    (reader, writer, peer)
}

#[derive(Debug, Default)]
struct WriteFaults {
    fail_next: AtomicU32,
    fail_all: AtomicBool,
}

impl WriteFaults {
    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

pub struct MemoryWriter {
    tx: mpsc::UnboundedSender<Frame>,
    faults: Arc<WriteFaults>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.faults.should_fail() {
            return Err(TransportError::Io("injected write failure".to_string()));
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Io("peer went away".to_string()))
    }
}

/// Remote end of a [`memory_transport`]
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    faults: Arc<WriteFaults>,
}

impl MemoryPeer {
    /// Deliver a frame to the server side. Returns false once the server
    /// stopped reading.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Frame::Text(text.into()))
    }

    /// Make the server's next read fail with `error`
    pub fn inject_read_error(&self, error: TransportError) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(Err(error)).is_ok())
    }

    /// End the stream as seen by the server's reader
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Fail the next `n` server writes
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every server write until turned off
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Next frame written by the server
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}
