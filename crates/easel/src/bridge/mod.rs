//! Request/response correlation bridge to a single host peer.
//!
//! Turns "write one frame, eventually read one matching frame" into an
//! awaitable call over a persistent message-oriented connection.
//!
//! # Architecture
//!
//! - **protocol**: Wire types (Request, Response, RequestId, ConnectionId)
//! - **codec**: JSON text-frame codec
//! - **pending**: In-flight request table (one per connection incarnation)
//! - **slot**: Single-peer connection slot with last-writer-wins eviction
//!
//! Each attached connection runs one reader and one writer task. `send`
//! callers suspend on a oneshot until the matching response arrives, the
//! per-call timeout elapses, or the connection closes, whichever is first.

pub mod codec;
pub mod pending;
pub mod protocol;
mod slot;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthSnapshot, PeerStatus};
use crate::transport::{FrameSink, FrameStream};
use crate::version::VersionInfo;
use codec::JsonCodec;
use pending::PendingGuard;
use protocol::{ConnectionId, Request, RequestId, Response};
use slot::{Connection, ConnectionSlot, run_writer};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a connection incarnation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    PeerClosed,
    /// A newer inbound connection replaced this one.
    Evicted,
    /// Read or write failed.
    Transport(String),
    /// The bridge was closed locally.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Evicted => f.write_str("replaced by a newer connection"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Shutdown => f.write_str("bridge shut down"),
        }
    }
}

/// Transport-level failure of one `send` call.
///
/// Logical failures (`ok: false`) are not errors here; they arrive as a normal
/// [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no peer connected")]
    NotConnected,
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("connection closed before '{command}' completed: {reason}")]
    ConnectionClosed { command: String, reason: CloseReason },
    #[error("failed to encode '{command}' request: {message}")]
    Encode { command: String, message: String },
}

impl BridgeError {
    /// Stable snake_case tag for machine-readable output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::Encode { .. } => "encode",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Deadline for `send` when no per-call timeout is given.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `EASEL_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = crate::config::env_millis("EASEL_REQUEST_TIMEOUT_MS") {
            config.request_timeout = timeout;
        }
        config
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Handle to one attached connection incarnation.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves once this connection has been torn down for any reason.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

struct BridgeInner {
    config: BridgeConfig,
    slot: ConnectionSlot,
    next_id: AtomicU64,
    request_codec: JsonCodec<Request>,
    response_codec: JsonCodec<Response>,
}

/// Controller-side bridge. Cheap to clone; clones share one connection slot.
///
/// The bridge never buffers calls made while disconnected and never retries;
/// both are caller policy.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                config,
                slot: ConnectionSlot::default(),
                next_id: AtomicU64::new(1),
                request_codec: JsonCodec::new(),
                response_codec: JsonCodec::new(),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.slot.current().is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.slot.current().map(|c| c.id())
    }

    /// Requests awaiting a response on the current connection.
    pub fn pending_count(&self) -> usize {
        self.inner
            .slot
            .current()
            .map(|c| c.pending().len())
            .unwrap_or(0)
    }

    pub fn health(&self) -> HealthSnapshot {
        let current = self.inner.slot.current();
        HealthSnapshot {
            status: if current.is_some() {
                PeerStatus::Connected
            } else {
                PeerStatus::Waiting
            },
            pending: current.as_ref().map(|c| c.pending().len()).unwrap_or(0),
            connection: current.map(|c| c.id()),
            version: VersionInfo::new(),
        }
    }

    /// Adopt a freshly established transport as the active connection.
    ///
    /// Any connection already open is evicted first: its pending requests fail
    /// with [`CloseReason::Evicted`] and its transport is closed.
    pub fn attach(&self, sink: FrameSink, stream: FrameStream) -> ConnectionHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(outbound_tx));
        let id = conn.id();

        if let Some(evicted) = self.inner.slot.install(Arc::clone(&conn)) {
            let failed = evicted.close(CloseReason::Evicted);
            tracing::info!(
                connection_id = %id,
                evicted_connection_id = %evicted.id(),
                failed_requests = failed,
                "Evicted previous peer connection"
            );
        }

        tracing::info!(connection_id = %id, "Peer connected");

        tokio::spawn(run_writer(Arc::clone(&conn), sink, outbound_rx));
        tokio::spawn(run_reader(
            Arc::clone(&self.inner),
            Arc::clone(&conn),
            stream,
        ));

        ConnectionHandle {
            id,
            shutdown: conn.shutdown_token(),
        }
    }

    /// Tear down the active connection, failing its pending requests.
    ///
    /// Returns false when no connection was open.
    pub fn close(&self) -> bool {
        match self.inner.slot.take() {
            Some(conn) => {
                let failed = conn.close(CloseReason::Shutdown);
                tracing::info!(connection_id = %conn.id(), failed_requests = failed, "Bridge closed");
                true
            }
            None => false,
        }
    }

    /// Invoke `command` on the peer with the configured default timeout.
    pub async fn send(
        &self,
        command: &str,
        params: serde_json::Value,
    ) -> Result<Response, BridgeError> {
        self.send_with_timeout(command, params, self.inner.config.request_timeout)
            .await
    }

    /// Invoke `command` on the peer and wait at most `timeout` for its response.
    ///
    /// Fails immediately with [`BridgeError::NotConnected`] when no peer is
    /// attached. A response arriving after the timeout is logged and dropped.
    pub async fn send_with_timeout(
        &self,
        command: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<Response, BridgeError> {
        let conn = self
            .inner
            .slot
            .current()
            .ok_or(BridgeError::NotConnected)?;

        let id = RequestId::from_sequence(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let frame = self
            .inner
            .request_codec
            .encode(&Request::new(id.clone(), command, params))
            .map_err(|e| BridgeError::Encode {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let closed = |reason: CloseReason| BridgeError::ConnectionClosed {
            command: command.to_string(),
            reason,
        };

        let rx = conn.pending().register(id.clone(), command).map_err(closed)?;
        let mut guard = PendingGuard::new(conn.pending(), id.clone());

        conn.enqueue(frame).map_err(closed)?;
        tracing::debug!(request_id = %id, command, connection_id = %conn.id(), "Request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                guard.disarm();
                tracing::debug!(
                    request_id = %id,
                    command,
                    ok = response.ok,
                    changed = response.changed,
                    "Response received"
                );
                Ok(response)
            }
            Ok(Ok(Err(reason))) => {
                guard.disarm();
                Err(closed(reason))
            }
            Ok(Err(_)) => Err(closed(
                conn.close_reason()
                    .unwrap_or(CloseReason::Transport("pending entry dropped".to_string())),
            )),
            Err(_) => {
                drop(guard);
                tracing::warn!(request_id = %id, command, ?timeout, "Request timed out");
                Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl BridgeInner {
    /// Route one inbound frame. Never fails: bad frames are logged and dropped.
    fn handle_frame(&self, conn: &Connection, frame: &str) {
        let response = match self.response_codec.decode(frame) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    error = %e,
                    frame_len = frame.len(),
                    "Dropping malformed message"
                );
                return;
            }
        };

        if let Err(stale) = conn.pending().resolve(response) {
            tracing::warn!(
                connection_id = %conn.id(),
                request_id = %stale.id,
                ok = stale.ok,
                "Dropping response with no pending request (expired, duplicate, or stale)"
            );
        }
    }
}

async fn run_reader(inner: Arc<BridgeInner>, conn: Arc<Connection>, mut stream: FrameStream) {
    let shutdown = conn.shutdown_token();

    let reason = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break conn.close_reason().unwrap_or(CloseReason::Shutdown);
            }

            frame = stream.next() => match frame {
                Some(Ok(text)) => inner.handle_frame(&conn, &text),
                Some(Err(e)) => {
                    tracing::warn!(connection_id = %conn.id(), error = %e, "Connection read error");
                    break CloseReason::Transport(e.to_string());
                }
                None => break CloseReason::PeerClosed,
            },
        }
    };

    // Close before clearing: a racing `send` then sees either a closed table
    // or an empty slot, never an open connection nobody reads from.
    let failed = conn.close(reason.clone());
    inner.slot.clear_if(conn.id());

    tracing::info!(
        connection_id = %conn.id(),
        %reason,
        failed_requests = failed,
        "Peer connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use serde_json::json;

    struct Peer {
        sink: FrameSink,
        stream: FrameStream,
    }

    impl Peer {
        async fn recv_request(&mut self) -> Request {
            let frame = self.stream.next().await.unwrap().unwrap();
            serde_json::from_str(&frame).unwrap()
        }

        async fn reply(&mut self, response: Response) {
            self.send_raw(serde_json::to_string(&response).unwrap())
                .await;
        }

        async fn send_raw(&mut self, frame: impl Into<String>) {
            self.sink.send(frame.into()).await.unwrap();
        }
    }

    fn connected(config: BridgeConfig) -> (Bridge, ConnectionHandle, Peer) {
        let bridge = Bridge::new(config);
        let (handle, peer) = attach_peer(&bridge);
        (bridge, handle, peer)
    }

    fn attach_peer(bridge: &Bridge) -> (ConnectionHandle, Peer) {
        let ((sink, stream), (peer_sink, peer_stream)) = crate::transport::in_memory();
        let handle = bridge.attach(sink, stream);
        (
            handle,
            Peer {
                sink: peer_sink,
                stream: peer_stream,
            },
        )
    }

    async fn wait_for_pending(bridge: &Bridge, n: usize) {
        while bridge.pending_count() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn send_without_connection_fails_immediately() {
        let bridge = Bridge::default();
        let err = bridge.send("echo", json!({})).await.unwrap_err();

        assert!(matches!(err, BridgeError::NotConnected));
        assert_eq!(err.kind(), "not_connected");
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn echo_round_trip_returns_exact_payload() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("echo", json!({"message": "hi"})).await }
        });

        let request = peer.recv_request().await;
        assert_eq!(request.command, "echo");
        assert_eq!(request.params, json!({"message": "hi"}));

        peer.reply(Response::success(
            request.id,
            false,
            Some(json!({"echo": "hi"})),
        ))
        .await;

        let response = call.await.unwrap().unwrap();
        assert!(response.ok);
        assert!(!response.changed);
        assert_eq!(response.data, Some(json!({"echo": "hi"})));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_ids_increase_monotonically() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        for expected in ["req_1", "req_2", "req_3"] {
            let call = tokio::spawn({
                let bridge = bridge.clone();
                async move { bridge.send("ping", json!({})).await }
            });
            let request = peer.recv_request().await;
            assert_eq!(request.id.as_str(), expected);
            peer.reply(Response::success(request.id, false, None)).await;
            call.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_calls_match_out_of_order_replies() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("layer.get", json!({"layerId": 1})).await }
        });
        let req_a = peer.recv_request().await;

        let second = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("layer.get", json!({"layerId": 2})).await }
        });
        let req_b = peer.recv_request().await;

        peer.reply(Response::success(
            req_b.id.clone(),
            false,
            Some(req_b.params.clone()),
        ))
        .await;
        peer.reply(Response::success(
            req_a.id.clone(),
            false,
            Some(req_a.params.clone()),
        ))
        .await;

        assert_eq!(
            first.await.unwrap().unwrap().data,
            Some(json!({"layerId": 1}))
        );
        assert_eq!(
            second.await.unwrap().unwrap().data,
            Some(json!({"layerId": 2}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_with_command_name() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let started = tokio::time::Instant::now();
        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                bridge
                    .send_with_timeout("filter.gaussian_blur", json!({}), Duration::from_millis(50))
                    .await
            }
        });
        let _ = peer.recv_request().await;

        let err = call.await.unwrap().unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));
        match &err {
            BridgeError::Timeout { command, timeout } => {
                assert_eq!(command, "filter.gaussian_blur");
                assert_eq!(*timeout, Duration::from_millis(50));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert!(err.to_string().contains("filter.gaussian_blur"));
        assert_eq!(bridge.pending_count(), 0);
        assert!(bridge.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_dropped() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let err = {
            let call = tokio::spawn({
                let bridge = bridge.clone();
                async move {
                    bridge
                        .send_with_timeout("slow", json!({}), Duration::from_millis(20))
                        .await
                }
            });
            let late = peer.recv_request().await;
            let err = call.await.unwrap().unwrap_err();
            peer.reply(Response::success(late.id, true, None)).await;
            err
        };
        assert!(matches!(err, BridgeError::Timeout { .. }));

        let next = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("ping", json!({})).await }
        });
        let request = peer.recv_request().await;
        peer.reply(Response::success(request.id, false, Some(json!("pong"))))
            .await;

        assert_eq!(next.await.unwrap().unwrap().data, Some(json!("pong")));
    }

    #[tokio::test]
    async fn peer_close_fails_all_pending_calls() {
        let (bridge, handle, mut peer) = connected(BridgeConfig::default());

        let mut calls = Vec::new();
        for n in 0..3 {
            let bridge = bridge.clone();
            calls.push(tokio::spawn(async move {
                bridge.send("layer.duplicate", json!({"layerId": n})).await
            }));
        }
        for _ in 0..3 {
            peer.recv_request().await;
        }
        wait_for_pending(&bridge, 3).await;

        drop(peer);
        handle.closed().await;

        for call in calls {
            match call.await.unwrap().unwrap_err() {
                BridgeError::ConnectionClosed { command, reason } => {
                    assert_eq!(command, "layer.duplicate");
                    assert_eq!(reason, CloseReason::PeerClosed);
                }
                other => panic!("expected ConnectionClosed, got {other:?}"),
            }
        }
        assert_eq!(bridge.pending_count(), 0);
        assert!(!bridge.is_connected());

        let err = bridge.send("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn garbage_and_unknown_ids_do_not_disturb_pending_calls() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("echo", json!({"message": "still here"})).await }
        });
        let request = peer.recv_request().await;

        peer.send_raw("{not json").await;
        peer.send_raw(r#"{"ok": true}"#).await;
        peer.reply(Response::success(RequestId::new("req_999"), false, None))
            .await;
        peer.reply(Response::success(
            request.id,
            false,
            Some(json!({"echo": "still here"})),
        ))
        .await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.data, Some(json!({"echo": "still here"})));
        assert!(bridge.is_connected());
    }

    #[tokio::test]
    async fn second_connection_evicts_first() {
        let bridge = Bridge::default();
        let (first_handle, mut first_peer) = attach_peer(&bridge);

        let stranded = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("document.save", json!({})).await }
        });
        first_peer.recv_request().await;
        wait_for_pending(&bridge, 1).await;

        let (second_handle, mut second_peer) = attach_peer(&bridge);

        match stranded.await.unwrap().unwrap_err() {
            BridgeError::ConnectionClosed { reason, .. } => {
                assert_eq!(reason, CloseReason::Evicted)
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
        first_handle.closed().await;
        assert!(first_peer.stream.next().await.is_none());

        assert_eq!(bridge.connection_id(), Some(second_handle.id()));

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("echo", json!({"message": "new"})).await }
        });
        let request = second_peer.recv_request().await;
        second_peer
            .reply(Response::success(request.id, false, Some(json!("new"))))
            .await;

        assert_eq!(call.await.unwrap().unwrap().data, Some(json!("new")));
        assert!(!second_handle.is_closed());
    }

    #[tokio::test]
    async fn close_fails_pending_with_shutdown() {
        let (bridge, handle, mut peer) = connected(BridgeConfig::default());

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("echo", json!({})).await }
        });
        peer.recv_request().await;
        wait_for_pending(&bridge, 1).await;

        assert!(bridge.close());
        assert!(!bridge.close());
        handle.closed().await;

        match call.await.unwrap().unwrap_err() {
            BridgeError::ConnectionClosed { reason, .. } => {
                assert_eq!(reason, CloseReason::Shutdown)
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_pending_entry() {
        let (bridge, _handle, mut peer) = connected(BridgeConfig::default());

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.send("echo", json!({})).await }
        });
        peer.recv_request().await;
        wait_for_pending(&bridge, 1).await;

        call.abort();
        let _ = call.await;

        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn health_reflects_connection_state() {
        let bridge = Bridge::default();
        let snapshot = bridge.health();
        assert_eq!(snapshot.status, PeerStatus::Waiting);
        assert!(snapshot.connection.is_none());

        let (handle, _peer) = attach_peer(&bridge);
        let snapshot = bridge.health();
        assert_eq!(snapshot.status, PeerStatus::Connected);
        assert_eq!(snapshot.connection, Some(handle.id()));
        assert_eq!(snapshot.pending, 0);
    }
}
