//! Liveness monitoring for a single connection

use crate::config::HeartbeatMode;
use crate::events::ErrorCode;
use crate::server::pumps::{Session, SharedWriter};
use crate::server::transport::{Frame, TransportError};

use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Run the configured heartbeat until the connection closes or is found dead
pub(crate) async fn run(session: Session, mode: HeartbeatMode, writer: SharedWriter) {
    match mode {
        HeartbeatMode::Disabled => {}
        HeartbeatMode::Ping {
            interval,
            timeout: silence_limit,
        } => ping_loop(session, interval, silence_limit, writer).await,
        HeartbeatMode::Payload {
            interval,
            max_failures,
            payload,
        } => payload_loop(session, interval, max_failures, payload, writer).await,
    }
}

/// Upper bound on one heartbeat write, including the wait for the shared writer
const BEAT_WRITE_DEADLINE: Duration = Duration::from_secs(10);

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

enum Beat {
    Sent,
    Failed(TransportError),
    /// The writer stayed busy past the deadline, usually a peer that stopped reading
    Stalled,
}

async fn send_beat(writer: &SharedWriter, frame: Frame, deadline: Duration) -> Beat {
    let write = async { writer.lock().await.write_frame(frame).await };
    match timeout(deadline, write).await {
        Ok(Ok(())) => Beat::Sent,
        Ok(Err(e)) => Beat::Failed(e),
        Err(_) => Beat::Stalled,
    }
}

async fn ping_loop(session: Session, interval: Duration, silence_limit: Duration, writer: SharedWriter) {
    let deadline = interval.min(BEAT_WRITE_DEADLINE);
    let mut ticker = ticker(interval);

    loop {
        tokio::select! {
            _ = session.closed() => return,
            _ = ticker.tick() => {}
        }

        let silent = session.liveness().silent_for();
        if silent > silence_limit {
            session.report(
                ErrorCode::HeartbeatTimeout,
                format!("Heartbeat timeout: no response for {}ms", silent.as_millis()),
            );
            session.close();
            return;
        }

        match send_beat(&writer, Frame::Ping(Bytes::new()), deadline).await {
            Beat::Sent => trace!(conn_id = %session.id(), "Ping sent"),
            // Silence keeps growing; the next tick decides
            Beat::Stalled => debug!(conn_id = %session.id(), "Ping stalled behind a blocked writer"),
            Beat::Failed(e) => {
                session.report(ErrorCode::HeartbeatFailed, format!("Ping error: {}", e));
                session.close();
                return;
            }
        }
    }
}

async fn payload_loop(
    session: Session,
    interval: Duration,
    max_failures: u32,
    payload: Bytes,
    writer: SharedWriter,
) {
    let max_failures = max_failures.max(1);
    let deadline = interval.min(BEAT_WRITE_DEADLINE);
    let mut ticker = ticker(interval);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = session.closed() => return,
            _ = ticker.tick() => {}
        }

        let reason = match send_beat(&writer, Frame::from_payload(payload.clone()), deadline).await {
            Beat::Sent => {
                failures = 0;
                continue;
            }
            Beat::Failed(e) => e.to_string(),
            Beat::Stalled => format!("write stalled for {}ms", deadline.as_millis()),
        };

        failures += 1;
        debug!(conn_id = %session.id(), failures, reason = %reason, "Heartbeat write failed");
        if failures >= max_failures {
            session.report(
                ErrorCode::HeartbeatFailed,
                format!("Heartbeat failed {} times in a row: {}", failures, reason),
            );
            session.close();
            return;
        }
    }
}
