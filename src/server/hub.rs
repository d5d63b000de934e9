//! The hub: single owner of the connection registry and topic index
//!
//! Every mutation and every read of the registry is a [`Command`] processed
//! one at a time by the actor task spawned in [`Hub::start`]. There are no
//! locks around the maps; ordering comes from the command queue alone, so a
//! query awaited after a mutation always observes it.

use crate::config::{DuplicatePolicy, HubConfig};
use crate::error::{HubError, Result};
use crate::events::{ConnectionEvent, ErrorCode, ErrorEvent, EventType};
use crate::server::connections::{Connection, ConnectionId, OfferError};
use crate::server::topics::{TopicEnvelope, TopicRegistry};
use crate::server::transport::{Frame, FrameReader, FrameWriter, CLOSE_NORMAL};
use crate::server::{heartbeat, pumps};

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Lifecycle of a hub instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Stopped,
    Running,
    Draining,
}

enum Command {
    Register {
        conn: Connection,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Subscribe {
        id: ConnectionId,
        topic: String,
    },
    Unsubscribe {
        id: ConnectionId,
        topic: String,
    },
    Broadcast {
        payload: Bytes,
        except: Option<ConnectionId>,
    },
    BroadcastTopic {
        topic: String,
        payload: Bytes,
    },
    Close {
        user_id: String,
        reply: oneshot::Sender<bool>,
    },
    Query(Query),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Query {
    ConnectionCount(oneshot::Sender<usize>),
    SubscriberCount(String, oneshot::Sender<usize>),
    Topics(oneshot::Sender<Vec<String>>),
    TopicsOf(ConnectionId, oneshot::Sender<Vec<String>>),
    IsLive(ConnectionId, oneshot::Sender<bool>),
}

struct HubInner {
    config: HubConfig,
    commands: mpsc::Sender<Command>,
    state: Arc<watch::Sender<HubState>>,
    conn_events: broadcast::Sender<ConnectionEvent>,
    errors: broadcast::Sender<ErrorEvent>,
    shutdown_requested: AtomicBool,
    tasks: TaskTracker,
}

/// Handle to a running hub. Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Spawn the hub actor on the current tokio runtime
    pub fn start(config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
        let (state, _) = watch::channel(HubState::Stopped);
        let state = Arc::new(state);
        let (conn_events, _) = broadcast::channel(config.event_capacity.max(1));
        let (errors, _) = broadcast::channel(config.event_capacity.max(1));
        let tasks = TaskTracker::new();

        let actor = HubActor {
            commands: rx,
            state: state.clone(),
            live: HashMap::new(),
            by_user: HashMap::new(),
            topics: TopicRegistry::new(config.topic_retention),
            duplicate_policy: config.duplicate_policy,
            shutdown_notice: config.shutdown_notice.clone(),
            conn_events: conn_events.clone(),
            errors: errors.clone(),
        };
        actor.state.send_replace(HubState::Running);
        tasks.spawn(actor.run());

        info!("Hub started");

        Self {
            inner: Arc::new(HubInner {
                config,
                commands,
                state,
                conn_events,
                errors,
                shutdown_requested: AtomicBool::new(false),
                tasks,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn state(&self) -> HubState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    /// Watch lifecycle transitions
    pub fn state_receiver(&self) -> watch::Receiver<HubState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to connect/disconnect/subscribe/unsubscribe events.
    /// Only events emitted after this call are received.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.conn_events.subscribe()
    }

    /// Subscribe to error events
    pub fn error_events(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.errors.subscribe()
    }

    /// Publish an error event, e.g. from a transport adapter
    pub fn emit_error(&self, event: ErrorEvent) {
        emit_error(&self.inner.errors, event);
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.inner
            .commands
            .send(cmd)
            .await
            .map_err(|_| HubError::NotRunning)
    }

    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| HubError::NotRunning)
    }

    /// Add a connection to the live set
    pub async fn register(&self, conn: Connection) -> Result<()> {
        self.ask(|reply| Command::Register { conn, reply }).await?
    }

    /// Remove a connection from the live set and every topic. No-op if not live.
    pub async fn unregister(&self, id: ConnectionId) {
        if self.send(Command::Unregister { id }).await.is_err() {
            debug!(conn_id = %id, "Unregister after hub stopped");
        }
    }

    pub async fn subscribe(&self, id: ConnectionId, topic: impl Into<String>) {
        let topic = topic.into();
        if self.send(Command::Subscribe { id, topic }).await.is_err() {
            debug!(conn_id = %id, "Subscribe after hub stopped");
        }
    }

    pub async fn unsubscribe(&self, id: ConnectionId, topic: impl Into<String>) {
        let topic = topic.into();
        if self.send(Command::Unsubscribe { id, topic }).await.is_err() {
            debug!(conn_id = %id, "Unsubscribe after hub stopped");
        }
    }

    /// Deliver a payload, unmodified, to every live connection
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.send(Command::Broadcast {
            payload,
            except: None,
        })
        .await
    }

    /// Deliver a payload to every live connection except `sender`
    pub async fn broadcast_except(&self, payload: impl Into<Bytes>, sender: ConnectionId) -> Result<()> {
        let payload = payload.into();
        self.send(Command::Broadcast {
            payload,
            except: Some(sender),
        })
        .await
    }

    /// Wrap `data` in a topic envelope and deliver it to the topic's subscribers
    pub async fn broadcast_topic(&self, topic: &str, data: impl Into<String>) -> Result<()> {
        let envelope = TopicEnvelope::new(topic, data);
        let payload = match envelope.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return Err(self.serialization_failed(topic, e)),
        };
        self.send(Command::BroadcastTopic {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    /// Serialize `value` as the envelope's `data` string, then broadcast it to the topic
    pub async fn broadcast_topic_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<()> {
        match serde_json::to_string(value) {
            Ok(data) => self.broadcast_topic(topic, data).await,
            Err(e) => Err(self.serialization_failed(topic, e)),
        }
    }

    fn serialization_failed(&self, topic: &str, e: serde_json::Error) -> HubError {
        self.emit_error(ErrorEvent::new(
            ErrorCode::Serialization,
            format!("Message serialization failed for topic {}: {}", topic, e),
        ));
        HubError::Serialization(e)
    }

    /// Close and unregister every live connection with this identity
    pub async fn close(&self, user_id: &str) -> bool {
        let user_id = user_id.to_string();
        self.ask(|reply| Command::Close { user_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn connection_count(&self) -> usize {
        self.ask(|tx| Command::Query(Query::ConnectionCount(tx)))
            .await
            .unwrap_or(0)
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topic = topic.to_string();
        self.ask(|tx| Command::Query(Query::SubscriberCount(topic, tx)))
            .await
            .unwrap_or(0)
    }

    /// All topic names, sorted
    pub async fn topics(&self) -> Vec<String> {
        self.ask(|tx| Command::Query(Query::Topics(tx)))
            .await
            .unwrap_or_default()
    }

    /// Topics a connection is subscribed to, sorted
    pub async fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        self.ask(|tx| Command::Query(Query::TopicsOf(id, tx)))
            .await
            .unwrap_or_default()
    }

    pub async fn is_live(&self, id: ConnectionId) -> bool {
        self.ask(|tx| Command::Query(Query::IsLive(id, tx)))
            .await
            .unwrap_or(false)
    }

    /// Register a transport-backed connection and start its pumps and heartbeat.
    ///
    /// On refusal the transport receives a close frame and is dropped.
    pub async fn attach<R, W>(&self, user_id: Option<String>, reader: R, mut writer: W) -> Result<ConnectionId>
    where
        R: FrameReader,
        W: FrameWriter,
    {
        let (conn, outbound) = Connection::new(user_id, self.inner.config.outbound_capacity);
        let session = pumps::Session::new(self.clone(), &conn);

        if let Err(e) = self.register(conn).await {
            let _ = writer.write_frame(Frame::Close(Some(CLOSE_NORMAL))).await;
            return Err(e);
        }

        let writer = pumps::shared_writer(writer);
        let tasks = &self.inner.tasks;
        tasks.spawn(pumps::run_outbound(session.clone(), outbound, writer.clone()));
        tasks.spawn(pumps::run_inbound(session.clone(), reader));
        if self.inner.config.heartbeat.is_enabled() {
            tasks.spawn(heartbeat::run(
                session.clone(),
                self.inner.config.heartbeat.clone(),
                writer,
            ));
        }

        Ok(session.id())
    }

    /// Drain the hub: notify clients, close every connection, clear the
    /// registries and wait for connection tasks, all within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self.inner.shutdown_requested.swap(true, Ordering::SeqCst) || !self.is_running() {
            return Err(HubError::NotRunning);
        }

        info!(deadline_ms = deadline.as_millis() as u64, "Hub shutting down");

        let drain = async {
            self.ask(|reply| Command::Shutdown { reply }).await?;
            self.inner.tasks.close();
            self.inner.tasks.wait().await;
            Ok(())
        };

        let result = match tokio::time::timeout(deadline, drain).await {
            Ok(result) => {
                info!("Hub shut down");
                result
            }
            Err(_) => {
                warn!("Hub shutdown deadline elapsed");
                Err(HubError::ShutdownTimeout)
            }
        };
        self.inner.state.send_replace(HubState::Stopped);
        result
    }
}

fn emit_error(errors: &broadcast::Sender<ErrorEvent>, event: ErrorEvent) {
    warn!(
        code = %event.code,
        conn = event.connection_id.as_deref().unwrap_or("-"),
        "{}",
        event.message
    );
    // No receivers is fine: nobody is listening
    let _ = errors.send(event);
}

struct HubActor {
    commands: mpsc::Receiver<Command>,
    state: Arc<watch::Sender<HubState>>,
    live: HashMap<ConnectionId, Connection>,
    by_user: HashMap<String, Vec<ConnectionId>>,
    topics: TopicRegistry,
    duplicate_policy: DuplicatePolicy,
    shutdown_notice: Bytes,
    conn_events: broadcast::Sender<ConnectionEvent>,
    errors: broadcast::Sender<ErrorEvent>,
}

impl HubActor {
    async fn run(mut self) {
        let mut drained = false;
        while let Some(cmd) = self.commands.recv().await {
            if !self.handle(cmd) {
                drained = true;
                break;
            }
        }

        // Every handle dropped without a shutdown: still release connections.
        // Otherwise `Hub::shutdown` reports Stopped once its wait ends.
        if !drained {
            self.drain();
            self.state.send_replace(HubState::Stopped);
        }
        debug!("Hub actor exited");
    }

    /// Apply one command. Returns false once the hub has drained.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Register { conn, reply } => {
                let _ = reply.send(self.register(conn));
            }
            Command::Unregister { id } => self.remove(id),
            Command::Subscribe { id, topic } => self.subscribe(id, topic),
            Command::Unsubscribe { id, topic } => self.unsubscribe(id, topic),
            Command::Broadcast { payload, except } => {
                let targets: Vec<ConnectionId> = self
                    .live
                    .keys()
                    .copied()
                    .filter(|id| Some(*id) != except)
                    .collect();
                let delivered = self.deliver(targets, &payload);
                debug!(recipients = delivered, bytes = payload.len(), "Broadcast");
            }
            Command::BroadcastTopic { topic, payload } => {
                let targets = self.topics.subscribers(&topic);
                if targets.is_empty() {
                    debug!(topic = %topic, "No subscribers for topic");
                } else {
                    let delivered = self.deliver(targets, &payload);
                    debug!(topic = %topic, recipients = delivered, "Topic broadcast");
                }
            }
            Command::Close { user_id, reply } => {
                let ids = self.by_user.get(&user_id).cloned().unwrap_or_default();
                for id in &ids {
                    self.remove(*id);
                }
                let _ = reply.send(!ids.is_empty());
            }
            Command::Query(query) => self.answer(query),
            Command::Shutdown { reply } => {
                self.drain();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn answer(&self, query: Query) {
        match query {
            Query::ConnectionCount(tx) => {
                let _ = tx.send(self.live.len());
            }
            Query::SubscriberCount(topic, tx) => {
                let _ = tx.send(self.topics.subscriber_count(&topic));
            }
            Query::Topics(tx) => {
                let _ = tx.send(self.topics.topics());
            }
            Query::TopicsOf(id, tx) => {
                let _ = tx.send(self.topics.topics_of(id));
            }
            Query::IsLive(id, tx) => {
                let _ = tx.send(self.live.contains_key(&id));
            }
        }
    }

    fn register(&mut self, conn: Connection) -> Result<()> {
        let id = conn.id();
        let user_id = conn.user_id().to_string();

        let clash = self.live.contains_key(&id)
            || (self.duplicate_policy == DuplicatePolicy::Reject && self.by_user.contains_key(&user_id));
        if clash {
            conn.close_transport();
            emit_error(
                &self.errors,
                ErrorEvent::new(
                    ErrorCode::DuplicateIdentity,
                    format!("Connection identity already registered: {}", user_id),
                )
                .for_connection(user_id.clone()),
            );
            return Err(HubError::DuplicateIdentity(user_id));
        }

        if self.duplicate_policy == DuplicatePolicy::Replace {
            for previous in self.by_user.get(&user_id).cloned().unwrap_or_default() {
                info!(conn_id = %previous, user_id = %user_id, "Replacing connection with same identity");
                self.remove(previous);
            }
        }

        self.by_user.entry(user_id.clone()).or_default().push(id);
        self.live.insert(id, conn);
        info!(conn_id = %id, user_id = %user_id, live = self.live.len(), "Client connected");
        self.emit(ConnectionEvent::new(EventType::Connect, user_id));
        Ok(())
    }

    /// Drop a connection from every index, close its queue and transport
    fn remove(&mut self, id: ConnectionId) {
        let Some(conn) = self.live.remove(&id) else {
            return;
        };
        let user_id = conn.user_id().to_string();

        if let Some(ids) = self.by_user.get_mut(&user_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
        let left = self.topics.remove_connection(id);
        conn.close_transport();
        drop(conn);

        info!(conn_id = %id, user_id = %user_id, topics = left.len(), "Client disconnected");
        self.emit(ConnectionEvent::new(EventType::Disconnect, user_id));
    }

    fn subscribe(&mut self, id: ConnectionId, topic: String) {
        let Some(conn) = self.live.get(&id) else {
            debug!(conn_id = %id, topic = %topic, "Ignoring subscribe from connection that is not live");
            return;
        };
        let user_id = conn.user_id().to_string();
        self.topics.subscribe(id, &topic);
        debug!(conn_id = %id, topic = %topic, "Subscribed");
        self.emit(ConnectionEvent::new(EventType::Subscribe, user_id).with_topic(topic));
    }

    fn unsubscribe(&mut self, id: ConnectionId, topic: String) {
        if !self.topics.unsubscribe(id, &topic) {
            return;
        }
        let user_id = self
            .live
            .get(&id)
            .map(|c| c.user_id().to_string())
            .unwrap_or_default();
        debug!(conn_id = %id, topic = %topic, "Unsubscribed");
        self.emit(ConnectionEvent::new(EventType::Unsubscribe, user_id).with_topic(topic));
    }

    /// Non-blocking fan-out. Recipients whose queue refuses the payload are dropped.
    fn deliver(&mut self, targets: Vec<ConnectionId>, payload: &Bytes) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();

        for id in targets {
            let Some(conn) = self.live.get(&id) else {
                continue;
            };
            match conn.offer(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(OfferError::Full) => {
                    warn!(conn_id = %id, user_id = conn.user_id(), "Outbound queue full, dropping slow client");
                    slow.push(id);
                }
                Err(OfferError::Closed) => {
                    debug!(conn_id = %id, "Outbound queue closed, dropping client");
                    slow.push(id);
                }
            }
        }

        for id in slow {
            self.remove(id);
        }
        delivered
    }

    fn drain(&mut self) {
        self.state.send_replace(HubState::Draining);

        let notice = self.shutdown_notice.clone();
        for conn in self.live.values() {
            // Best effort: a full queue is about to be closed anyway
            let _ = conn.offer(notice.clone());
        }

        let ids: Vec<ConnectionId> = self.live.keys().copied().collect();
        info!(connections = ids.len(), "Draining hub");
        for id in ids {
            self.remove(id);
        }
        self.topics.clear();
        self.by_user.clear();
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.conn_events.send(event);
    }
}
