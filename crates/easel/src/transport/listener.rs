//! Listener form: the controller side opens a port and the host peer connects.
//!
//! Routes:
//! - `GET /` (WebSocket upgrade): attaches the peer to the bridge, evicting any
//!   previous one
//! - `GET /health`: JSON [`HealthSnapshot`]

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::frame;
use crate::bridge::Bridge;
use crate::config::{env_parse, env_string};
use crate::health::HealthSnapshot;

pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ListenerConfig {
    /// Defaults overridden by `EASEL_HOST` and `EASEL_PORT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("EASEL_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("EASEL_PORT") {
            config.port = port;
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn routes(bridge: Bridge) -> Router {
    Router::new()
        .route("/", get(peer_upgrade))
        .route("/health", get(health))
        .with_state(bridge)
}

async fn peer_upgrade(ws: WebSocketUpgrade, State(bridge): State<Bridge>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = frame::from_axum(socket);
        bridge.attach(sink, stream);
    })
}

async fn health(State(bridge): State<Bridge>) -> Json<HealthSnapshot> {
    Json(bridge.health())
}

/// Bind `config` and serve until `shutdown` fires.
pub async fn serve(
    config: ListenerConfig,
    bridge: Bridge,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr()).await?;
    serve_with_listener(listener, bridge, shutdown).await
}

/// Serve on an already-bound listener (port 0 in tests).
pub async fn serve_with_listener(
    listener: TcpListener,
    bridge: Bridge,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let actual_addr = listener.local_addr()?;
    info!("Bridge listening on ws://{}", actual_addr);

    let app = routes(bridge.clone());
    let bridge_for_shutdown = bridge.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            // Upgraded sockets outlive the HTTP connection; close the peer explicitly.
            bridge_for_shutdown.close();
        })
        .await?;

    info!("Listener shutdown complete");
    Ok(())
}
