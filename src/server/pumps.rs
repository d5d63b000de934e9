//! Per-connection inbound and outbound pumps

use crate::events::{ErrorCode, ErrorEvent};
use crate::server::connections::{Connection, ConnectionId, OutboundReceiver};
use crate::server::hub::Hub;
use crate::server::transport::{Frame, FrameReader, FrameWriter, TransportError, CLOSE_NORMAL};

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Write half shared by the outbound pump and the heartbeat monitor
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn FrameWriter>>>;

pub(crate) fn shared_writer<W: FrameWriter>(writer: W) -> SharedWriter {
    let writer: Box<dyn FrameWriter> = Box::new(writer);
    Arc::new(tokio::sync::Mutex::new(writer))
}

/// Last time the peer showed signs of life
#[derive(Debug)]
pub(crate) struct Liveness {
    last_seen: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub(crate) fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// What the pumps and heartbeat of one connection share
#[derive(Clone)]
pub(crate) struct Session {
    id: ConnectionId,
    user_id: Arc<str>,
    hub: Hub,
    closer: CancellationToken,
    liveness: Arc<Liveness>,
}

impl Session {
    pub(crate) fn new(hub: Hub, conn: &Connection) -> Self {
        Self {
            id: conn.id(),
            user_id: Arc::from(conn.user_id()),
            hub,
            closer: conn.close_signal(),
            liveness: Arc::new(Liveness::new()),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Ask every task of this connection to stop and the transport to close
    pub(crate) fn close(&self) {
        self.closer.cancel();
    }

    pub(crate) async fn closed(&self) {
        self.closer.cancelled().await
    }

    pub(crate) fn report(&self, code: ErrorCode, message: String) {
        self.hub
            .emit_error(ErrorEvent::new(code, message).for_connection(self.user_id()));
    }
}

/// Meaning of one inbound data payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundCommand {
    /// `sub:<topic>`
    Subscribe(String),
    /// `unsub:<topic>`
    Unsubscribe(String),
    /// The configured acknowledgement of a heartbeat
    HeartbeatAck,
    /// A command with an empty topic name
    Ignored,
    /// Anything else, broadcast to the other connections
    Message,
}

/// Classify a client payload
pub fn classify(payload: &[u8], heartbeat_ack: &[u8]) -> InboundCommand {
    if let Some(topic) = payload.strip_prefix(b"sub:") {
        return topic_command(topic, InboundCommand::Subscribe);
    }
    if let Some(topic) = payload.strip_prefix(b"unsub:") {
        return topic_command(topic, InboundCommand::Unsubscribe);
    }
    if !heartbeat_ack.is_empty() && payload == heartbeat_ack {
        return InboundCommand::HeartbeatAck;
    }
    InboundCommand::Message
}

fn topic_command(topic: &[u8], build: fn(String) -> InboundCommand) -> InboundCommand {
    if topic.is_empty() {
        InboundCommand::Ignored
    } else {
        build(String::from_utf8_lossy(topic).into_owned())
    }
}

/// Read frames until the transport ends, fails or the connection is closed,
/// then unregister.
pub(crate) async fn run_inbound<R: FrameReader>(session: Session, mut reader: R) {
    let heartbeat_ack = session.hub.config().heartbeat_ack.clone();
    let echo = session.hub.config().echo_to_sender;

    loop {
        let result = tokio::select! {
            _ = session.closed() => {
                debug!(conn_id = %session.id, "Connection closed by hub");
                break;
            }
            result = reader.read_frame() => result,
        };

        let payload = match result {
            Ok(Some(Frame::Text(text))) => Bytes::from(text),
            Ok(Some(Frame::Binary(data))) => data,
            Ok(Some(Frame::Ping(_))) | Ok(Some(Frame::Pong(_))) => {
                // Transports answer pings themselves; both prove the peer is alive
                session.liveness.touch();
                continue;
            }
            Ok(Some(Frame::Close(code))) => {
                let closed = TransportError::Closed { code };
                if closed.is_expected_close() {
                    debug!(conn_id = %session.id, code = ?code, "Client sent close");
                } else {
                    session.report(ErrorCode::ReadFailed, format!("Read message error: {}", closed));
                }
                break;
            }
            Ok(None) => {
                debug!(conn_id = %session.id, "Client stream ended");
                break;
            }
            Err(e) if e.is_expected_close() => {
                debug!(conn_id = %session.id, error = %e, "Client closed");
                break;
            }
            Err(e) => {
                session.report(ErrorCode::ReadFailed, format!("Read message error: {}", e));
                break;
            }
        };

        session.liveness.touch();
        trace!(conn_id = %session.id, bytes = payload.len(), "Received payload");

        match classify(&payload, &heartbeat_ack) {
            InboundCommand::Subscribe(topic) => session.hub.subscribe(session.id, topic).await,
            InboundCommand::Unsubscribe(topic) => session.hub.unsubscribe(session.id, topic).await,
            InboundCommand::HeartbeatAck => {}
            InboundCommand::Ignored => {
                debug!(conn_id = %session.id, "Ignoring command without topic");
            }
            InboundCommand::Message => {
                let result = if echo {
                    session.hub.broadcast(payload).await
                } else {
                    session.hub.broadcast_except(payload, session.id).await
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
    session.hub.unregister(session.id).await;
}

/// Drain the outbound queue into the transport. A closed queue ends the
/// session with a close frame.
pub(crate) async fn run_outbound(session: Session, mut outbound: OutboundReceiver, writer: SharedWriter) {
    while let Some(payload) = outbound.recv().await {
        let result = writer.lock().await.write_frame(Frame::from_payload(payload)).await;
        if let Err(e) = result {
            session.report(ErrorCode::WriteFailed, format!("Write message error: {}", e));
            session.close();
            return;
        }
    }

    debug!(conn_id = %session.id, "Outbound queue closed, sending close frame");
    let _ = writer
        .lock()
        .await
        .write_frame(Frame::Close(Some(CLOSE_NORMAL)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACK: &[u8] = b"heartbeat_ack";

    #[test]
    fn test_classify_commands() {
        assert_eq!(
            classify(b"sub:news", ACK),
            InboundCommand::Subscribe("news".to_string())
        );
        assert_eq!(
            classify(b"unsub:news", ACK),
            InboundCommand::Unsubscribe("news".to_string())
        );
        assert_eq!(classify(b"heartbeat_ack", ACK), InboundCommand::HeartbeatAck);
        assert_eq!(classify(b"hello", ACK), InboundCommand::Message);
    }

    #[test]
    fn test_classify_edge_cases() {
        assert_eq!(classify(b"sub:", ACK), InboundCommand::Ignored);
        assert_eq!(classify(b"unsub:", ACK), InboundCommand::Ignored);
        // Prefix must be at the start
        assert_eq!(classify(b" sub:news", ACK), InboundCommand::Message);
        assert_eq!(classify(b"SUB:news", ACK), InboundCommand::Message);
        // Topic keeps everything after the prefix
        assert_eq!(
            classify(b"sub:a:b c", ACK),
            InboundCommand::Subscribe("a:b c".to_string())
        );
        // Ack must match exactly
        assert_eq!(classify(b"heartbeat_ack ", ACK), InboundCommand::Message);
        // No ack configured
        assert_eq!(classify(b"", b""), InboundCommand::Message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_tracks_elapsed_time() {
        let liveness = Liveness::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(liveness.silent_for() >= Duration::from_secs(5));
        liveness.touch();
        assert!(liveness.silent_for() < Duration::from_secs(1));
    }
}
