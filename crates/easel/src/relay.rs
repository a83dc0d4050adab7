//! Relay: lets two dialers reach each other when neither can listen.
//!
//! Pure forwarder. Each connection is assigned a [`RelayRole`] from its
//! request path at upgrade time; every data frame it sends is passed
//! unmodified to whichever connection currently holds the other role. No
//! parsing, no buffering: with no counterpart the frame is dropped.
//!
//! Routes:
//! - `GET /` -> [`RelayRole::Primary`] (the host peer, same URL it would use
//!   against a listener bridge)
//! - `GET {secondary_path}` -> [`RelayRole::Secondary`] (the dialing controller)
//! - `GET /health` -> which roles are connected

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Json},
    routing::get,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::protocol::ConnectionId;
use crate::config::{env_parse, env_string};
use crate::transport::listener::DEFAULT_PORT;

pub const DEFAULT_SECONDARY_PATH: &str = "/controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRole {
    Primary,
    Secondary,
}

impl RelayRole {
    pub fn counterpart(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for RelayRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub secondary_path: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            secondary_path: DEFAULT_SECONDARY_PATH.to_string(),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `EASEL_HOST`, `EASEL_PORT` and `EASEL_RELAY_SECONDARY_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env_string("EASEL_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("EASEL_PORT") {
            config.port = port;
        }
        if let Some(path) = env_string("EASEL_RELAY_SECONDARY_PATH") {
            config.secondary_path = path;
        }
        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Normalize a secondary path to exactly one leading slash and check it can be
/// routed next to `/` and `/health`.
pub fn secondary_route(path: &str) -> anyhow::Result<String> {
    let route = format!("/{}", path.trim().trim_start_matches('/'));
    if route == "/" || route == "/health" {
        anyhow::bail!("relay secondary path {route:?} collides with a built-in route");
    }
    if let Some(c) = route
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~')))
    {
        anyhow::bail!("relay secondary path {route:?} contains unsupported character {c:?}");
    }
    Ok(route)
}

struct RelayPeer {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

/// Role -> live connection. Cheap to clone.
#[derive(Clone, Default)]
pub struct Relay {
    peers: Arc<DashMap<RelayRole, RelayPeer>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub primary: bool,
    pub secondary: bool,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, role: RelayRole) -> bool {
        self.peers.contains_key(&role)
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            primary: self.is_connected(RelayRole::Primary),
            secondary: self.is_connected(RelayRole::Secondary),
        }
    }

    /// Register a connection for `role`, replacing (and thereby closing) any
    /// previous holder of that role.
    fn register(&self, role: RelayRole, tx: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let id = ConnectionId::new();
        if let Some(previous) = self.peers.insert(role, RelayPeer { id, tx }) {
            info!(%role, evicted_connection_id = %previous.id, "Replacing relay peer");
        }
        id
    }

    fn unregister(&self, role: RelayRole, id: ConnectionId) {
        self.peers.remove_if(&role, |_, peer| peer.id == id);
    }

    /// Pass `msg` to the counterpart of `from`. Returns false when nobody is there.
    fn forward(&self, from: RelayRole, msg: Message) -> bool {
        match self.peers.get(&from.counterpart()) {
            Some(peer) => peer.tx.send(msg).is_ok(),
            None => false,
        }
    }

    async fn run_peer(self, role: RelayRole, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = self.register(role, tx);
        info!(%role, connection_id = %id, "Relay peer connected");

        // Ends when this peer is unregistered or replaced (sender dropped).
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "Relay write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if !self.forward(role, msg) {
                        tracing::warn!(
                            from = %role,
                            to = %role.counterpart(),
                            "No counterpart connected, dropping message"
                        );
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(%role, connection_id = %id, error = %e, "Relay read error");
                    break;
                }
            }
        }

        self.unregister(role, id);
        let _ = writer.await;
        info!(%role, connection_id = %id, "Relay peer disconnected");
    }
}

/// Build the relay router. Fails when `secondary_path` is not routable.
pub fn routes(relay: Relay, secondary_path: &str) -> anyhow::Result<Router> {
    let secondary = secondary_route(secondary_path)?;
    Ok(Router::new()
        .route("/", get(primary_upgrade))
        .route(&secondary, get(secondary_upgrade))
        .route("/health", get(health))
        .with_state(relay))
}

async fn primary_upgrade(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay.run_peer(RelayRole::Primary, socket))
}

async fn secondary_upgrade(ws: WebSocketUpgrade, State(relay): State<Relay>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay.run_peer(RelayRole::Secondary, socket))
}

async fn health(State(relay): State<Relay>) -> Json<RelayStatus> {
    Json(relay.status())
}

/// Bind `config` and relay until `shutdown` fires.
pub async fn serve(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    secondary_route(&config.secondary_path)?;
    let listener = TcpListener::bind(config.addr()).await?;
    serve_with_listener(listener, Relay::new(), &config.secondary_path, shutdown).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    relay: Relay,
    secondary_path: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let secondary = secondary_route(secondary_path)?;
    let app = routes(relay.clone(), &secondary)?;
    let actual_addr = listener.local_addr()?;
    info!(
        "Relay listening on ws://{} (primary: /, secondary: {})",
        actual_addr, secondary
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            // Dropping the senders closes every relayed socket.
            relay.peers.clear();
        })
        .await?;

    info!("Relay shutdown complete");
    Ok(())
}
