//! Tankws daemon - WebSocket connection hub server

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;
use tankws::server::{run_websocket_server, UpgradeSettings, WsState};
use tankws::{DuplicatePolicy, HeartbeatMode, Hub, HubConfig, TopicRetention};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Heartbeat {
    Off,
    Ping,
    Payload,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Duplicates {
    Replace,
    Reject,
    Coexist,
}

#[derive(Parser)]
#[command(name = "tankwsd")]
#[command(about = "Tankws WebSocket connection hub daemon")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "TANKWS_BIND")]
    bind: String,

    /// Heartbeat strategy
    #[arg(long, value_enum, default_value = "ping", env = "TANKWS_HEARTBEAT")]
    heartbeat: Heartbeat,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30, env = "TANKWS_HEARTBEAT_INTERVAL")]
    heartbeat_interval: u64,

    /// Seconds without a pong before a ping-mode connection is closed
    #[arg(long, default_value_t = 60, env = "TANKWS_HEARTBEAT_TIMEOUT")]
    heartbeat_timeout: u64,

    /// Consecutive failed payload heartbeats before a connection is closed
    #[arg(long, default_value_t = 3, env = "TANKWS_HEARTBEAT_MAX_FAILURES")]
    heartbeat_max_failures: u32,

    /// Outbound queue capacity per connection
    #[arg(long, default_value_t = 256, env = "TANKWS_OUTBOUND_CAPACITY")]
    outbound_capacity: usize,

    /// What to do when a user_id connects twice
    #[arg(long, value_enum, default_value = "coexist", env = "TANKWS_DUPLICATES")]
    duplicates: Duplicates,

    /// Remove topics once their last subscriber leaves
    #[arg(long, env = "TANKWS_PRUNE_TOPICS")]
    prune_topics: bool,

    /// Required `token` query parameter; no auth when unset
    #[arg(long, env = "TANKWS_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Accepted `Origin` header values; any origin when none are given
    #[arg(long = "allowed-origin", env = "TANKWS_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Largest inbound message in bytes
    #[arg(long, env = "TANKWS_MAX_MESSAGE_SIZE")]
    max_message_size: Option<usize>,

    /// Seconds to wait for connections to drain on shutdown
    #[arg(long, default_value_t = 5, env = "TANKWS_SHUTDOWN_DEADLINE")]
    shutdown_deadline: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    fn hub_config(&self) -> HubConfig {
        let interval = Duration::from_secs(self.heartbeat_interval);
        let heartbeat = match self.heartbeat {
            Heartbeat::Off => HeartbeatMode::Disabled,
            Heartbeat::Ping => HeartbeatMode::ping(interval, Duration::from_secs(self.heartbeat_timeout)),
            Heartbeat::Payload => HeartbeatMode::payload(interval, self.heartbeat_max_failures),
        };
        let duplicates = match self.duplicates {
            Duplicates::Replace => DuplicatePolicy::Replace,
            Duplicates::Reject => DuplicatePolicy::Reject,
            Duplicates::Coexist => DuplicatePolicy::Coexist,
        };
        let retention = if self.prune_topics {
            TopicRetention::Prune
        } else {
            TopicRetention::Keep
        };

        HubConfig::new()
            .outbound_capacity(self.outbound_capacity)
            .heartbeat(heartbeat)
            .duplicate_policy(duplicates)
            .topic_retention(retention)
    }

    fn upgrade_settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            max_message_size: self.max_message_size,
            allowed_origins: (!self.allowed_origins.is_empty()).then(|| self.allowed_origins.clone()),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    run_server(args).await
}

async fn run_server(args: Args) -> Result<()> {
    let bind_addr: SocketAddr = args.bind.parse().context("Invalid bind address")?;
    let deadline = Duration::from_secs(args.shutdown_deadline);

    let hub = Hub::start(args.hub_config());
    spawn_event_loggers(&hub);

    let mut state = WsState::new(hub.clone()).with_upgrade_settings(args.upgrade_settings());
    if let Some(token) = args.auth_token.clone() {
        state = state.with_auth(move |req| req.query("token") == Some(token.as_str()));
    }

    info!(addr = %bind_addr, "Tankws daemon starting");

    // The HTTP server stops accepting once the hub has begun draining
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(run_websocket_server(bind_addr, state, async move {
        let _ = stop_rx.await;
    }));

    tokio::select! {
        result = server => {
            // Bind failure or server crash before any signal
            result.context("WebSocket server task failed")??;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining hub");
        }
    }

    if let Err(e) = hub.shutdown(deadline).await {
        warn!(error = %e, "Hub did not shut down cleanly");
    }
    let _ = stop_tx.send(());

    info!("Tankws daemon stopped");
    Ok(())
}

fn spawn_event_loggers(hub: &Hub) {
    let mut events = hub.connection_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    event = %event.event_type,
                    user_id = %event.connection_id,
                    topic = event.topic.as_deref().unwrap_or("-"),
                    "Connection event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Connection event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut errors = hub.error_events();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(event) => error!(
                    code = %event.code,
                    user_id = event.connection_id.as_deref().unwrap_or("-"),
                    "{}",
                    event.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Error event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut state = hub.state_receiver();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            info!(state = ?current, "Hub state changed");
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
