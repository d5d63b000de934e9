//! WebSocket upgrade endpoint
//!
//! Authenticates the upgrade request, upgrades the HTTP connection and hands
//! the split socket to [`Hub::attach`] through the frame transport traits.

use crate::events::{ErrorCode, ErrorEvent};
use crate::server::hub::Hub;
use crate::server::transport::{Frame, FrameReader, FrameWriter, TransportError, CLOSE_ABNORMAL};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, Utf8Bytes, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What an auth predicate gets to look at
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// Decides whether an upgrade request may proceed
pub type AuthPredicate = Arc<dyn Fn(&UpgradeRequest) -> bool + Send + Sync>;

/// Limits and origin policy applied to every upgrade
#[derive(Debug, Clone, Default)]
pub struct UpgradeSettings {
    pub read_buffer_size: Option<usize>,
    pub max_message_size: Option<usize>,
    pub max_frame_size: Option<usize>,
    /// Accepted `Origin` values; any origin when unset
    pub allowed_origins: Option<Vec<String>>,
}

impl UpgradeSettings {
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match &self.allowed_origins {
            None => true,
            Some(allowed) => origin.is_some_and(|o| allowed.iter().any(|a| a.eq_ignore_ascii_case(o))),
        }
    }

    fn apply(&self, mut ws: WebSocketUpgrade) -> WebSocketUpgrade {
        if let Some(size) = self.read_buffer_size {
            ws = ws.read_buffer_size(size);
        }
        if let Some(size) = self.max_message_size {
            ws = ws.max_message_size(size);
        }
        if let Some(size) = self.max_frame_size {
            ws = ws.max_frame_size(size);
        }
        ws
    }
}

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub hub: Hub,
    pub auth: Option<AuthPredicate>,
    pub upgrade: UpgradeSettings,
}

impl WsState {
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            auth: None,
            upgrade: UpgradeSettings::default(),
        }
    }

    pub fn with_upgrade_settings(mut self, settings: UpgradeSettings) -> Self {
        self.upgrade = settings;
        self
    }

    pub fn with_auth<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(predicate));
        self
    }
}

/// Create the WebSocket router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request = UpgradeRequest { headers, query };

    if let Some(auth) = &state.auth {
        if !auth(&request) {
            state
                .hub
                .emit_error(ErrorEvent::new(ErrorCode::AuthFailed, "Authentication failed"));
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    if !state.upgrade.origin_allowed(request.header(ORIGIN.as_str())) {
        state.hub.emit_error(ErrorEvent::new(
            ErrorCode::UpgradeFailed,
            format!(
                "WebSocket upgrade failed: origin {} not allowed",
                request.header(ORIGIN.as_str()).unwrap_or("<none>")
            ),
        ));
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            state.hub.emit_error(ErrorEvent::new(
                ErrorCode::UpgradeFailed,
                format!("WebSocket upgrade failed: {}", rejection),
            ));
            return rejection.into_response();
        }
    };

    if !state.hub.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let user_id = request.query.get("user_id").cloned();
    let hub = state.hub.clone();
    let failed = state.hub.clone();

    state
        .upgrade
        .apply(ws)
        .on_failed_upgrade(move |e| {
            failed.emit_error(ErrorEvent::new(
                ErrorCode::UpgradeFailed,
                format!("WebSocket upgrade failed: {}", e),
            ));
        })
        .on_upgrade(move |socket| handle_socket(socket, hub, user_id))
}

async fn handle_socket(socket: WebSocket, hub: Hub, user_id: Option<String>) {
    let (sink, stream) = socket.split();

    match hub.attach(user_id, WsReader { stream }, WsWriter { sink }).await {
        Ok(id) => debug!(conn_id = %id, "WebSocket client attached"),
        Err(e) => warn!(error = %e, "WebSocket client refused"),
    }
}

struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        let message = match self.stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(read_error(e)),
            None => return Ok(None),
        };

        let frame = match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(frame) => Frame::Close(frame.map(|f| f.code)),
        };
        Ok(Some(frame))
    }
}

fn read_error(e: axum::Error) -> TransportError {
    let inner = e.into_inner();
    if vanished_without_close(&*inner) {
        TransportError::Closed {
            code: Some(CLOSE_ABNORMAL),
        }
    } else {
        TransportError::Io(inner.to_string())
    }
}

/// Whether anything in the error chain says the peer dropped the stream
/// without a close frame
fn vanished_without_close(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        // tungstenite's ResetWithoutClosingHandshake
        if err.to_string().contains("without closing handshake") {
            return true;
        }
        current = err.source();
    }
    false
}

struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
                code,
                reason: Utf8Bytes::from_static(""),
            })),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Serve the upgrade endpoint until `shutdown` resolves
pub async fn run_websocket_server<F>(bind_addr: SocketAddr, state: WsState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "WebSocket server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
