//! Host peer runtime: read requests off one connection, dispatch, write replies.
//!
//! Every request runs on its own task so a slow command never holds up
//! others; replies go back in completion order, each tagged with its request
//! id. Handler tasks still running when the connection ends are aborted since
//! their replies can no longer be delivered.

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::HostConfig;
use super::dispatch::Dispatcher;
use crate::bridge::codec::{CodecError, JsonCodec, recover_id};
use crate::bridge::protocol::{Request, RequestId, Response};
use crate::transport::dialer;
use crate::transport::frame::{self, FrameSink, FrameStream, TransportError};
use crate::transport::listener::ListenerConfig;

/// Serve requests arriving on one connection until the peer closes it or
/// `shutdown` fires.
pub async fn serve_connection(
    dispatcher: Dispatcher,
    mut sink: FrameSink,
    mut stream: FrameStream,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let request_codec = JsonCodec::<Request>::new();
    let response_codec = JsonCodec::<Response>::new();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Response>();
    let mut handlers = JoinSet::new();

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Host connection shutting down");
                break Ok(());
            }

            Some(response) = reply_rx.recv() => {
                let frame = match response_codec.encode(&response) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(request_id = %response.id, error = %e, "Failed to encode response");
                        continue;
                    }
                };
                tracing::trace!(request_id = %response.id, ok = response.ok, "Writing response");
                if let Err(e) = sink.send(frame).await {
                    break Err(e);
                }
            }

            Some(joined) = handlers.join_next() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Command task failed");
                }
            }

            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break Err(e),
                    None => {
                        tracing::debug!("Bridge closed the connection");
                        break Ok(());
                    }
                };

                match request_codec.decode(&frame) {
                    Ok(request) => {
                        tracing::trace!(request_id = %request.id, command = %request.command, "Request received");
                        let dispatcher = dispatcher.clone();
                        let reply_tx = reply_tx.clone();
                        handlers.spawn(async move {
                            let response = dispatcher.dispatch(request).await;
                            let _ = reply_tx.send(response);
                        });
                    }
                    Err(e) => reject_malformed(&frame, e, &reply_tx),
                }
            }
        }
    };

    handlers.shutdown().await;
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Error closing host connection");
    }
    result
}

/// Answer a frame that is not a valid request, if it names an id to answer.
fn reject_malformed(frame: &str, err: CodecError, reply_tx: &mpsc::UnboundedSender<Response>) {
    let detail = match &err {
        CodecError::Malformed(inner) | CodecError::Encode(inner) => inner.to_string(),
    };
    match recover_id(frame) {
        Some(id) => {
            tracing::warn!(request_id = %id, error = %detail, "Malformed request");
            let _ = reply_tx.send(Response::failure(
                RequestId::new(id),
                false,
                format!("Malformed request: {detail}"),
            ));
        }
        None => {
            tracing::warn!(error = %detail, "Dropping unparseable frame");
        }
    }
}

/// Dial `config.url`, serve, and redial after `reconnect_delay` until `shutdown`.
pub async fn run_host(config: HostConfig, dispatcher: Dispatcher, shutdown: CancellationToken) {
    info!(
        url = %config.url,
        commands = dispatcher.table().len(),
        "Host starting"
    );

    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = dialer::connect(&config.url, config.connect_timeout) => result,
        };

        match connected {
            Ok((sink, stream)) => {
                info!(url = %config.url, "Connected to bridge");
                match serve_connection(dispatcher.clone(), sink, stream, shutdown.clone()).await {
                    Ok(()) => info!(url = %config.url, "Bridge connection ended"),
                    Err(e) => tracing::warn!(url = %config.url, error = %e, "Bridge connection failed"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not reach bridge");
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
        tracing::debug!(
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    info!("Host stopped");
}

#[derive(Clone)]
struct ListenState {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

/// Accept dialing bridges on `/` instead of dialing out.
pub async fn serve_listener(
    config: ListenerConfig,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr()).await?;
    serve_listener_with(listener, dispatcher, shutdown).await
}

pub async fn serve_listener_with(
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Host listening on ws://{}", listener.local_addr()?);

    let state = ListenState {
        dispatcher,
        shutdown: shutdown.clone(),
    };
    let app = Router::new()
        .route("/", get(bridge_upgrade))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Host listener shutdown complete");
    Ok(())
}

async fn bridge_upgrade(ws: WebSocketUpgrade, State(state): State<ListenState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = frame::from_axum(socket);
        info!("Bridge connected to host");
        if let Err(e) = serve_connection(state.dispatcher, sink, stream, state.shutdown).await {
            tracing::warn!(error = %e, "Bridge connection failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::host::demo::demo_commands;
    use crate::host::dispatch::{CommandOutput, CommandTable};
    use crate::transport::in_memory;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        sink: FrameSink,
        stream: FrameStream,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<(), TransportError>>,
    }

    fn spawn_host(table: CommandTable) -> Harness {
        let ((sink, stream), (host_sink, host_stream)) = in_memory();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_connection(
            Dispatcher::new(table),
            host_sink,
            host_stream,
            shutdown.clone(),
        ));
        Harness {
            sink,
            stream,
            shutdown,
            task,
        }
    }

    async fn next_response(stream: &mut FrameStream) -> serde_json::Value {
        let frame = stream.next().await.unwrap().unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn replies_with_request_id() {
        let mut host = spawn_host(demo_commands());

        host.sink
            .send(r#"{"id":"req_3","command":"echo","params":{"message":"hi"}}"#.to_string())
            .await
            .unwrap();

        let response = next_response(&mut host.stream).await;
        assert_eq!(
            response,
            json!({"id": "req_3", "ok": true, "changed": false, "data": {"echo": "hi"}})
        );
    }

    #[tokio::test]
    async fn unknown_command_does_not_stop_loop() {
        let mut host = spawn_host(demo_commands());

        host.sink
            .send(r#"{"id":"req_1","command":"unknown.thing"}"#.to_string())
            .await
            .unwrap();
        let response = next_response(&mut host.stream).await;
        assert_eq!(response["error"], "Unknown command: unknown.thing");
        assert_eq!(response["ok"], false);
        assert_eq!(response["changed"], false);

        host.sink
            .send(r#"{"id":"req_2","command":"ping"}"#.to_string())
            .await
            .unwrap();
        let response = next_response(&mut host.stream).await;
        assert_eq!(response["id"], "req_2");
        assert_eq!(response["data"]["pong"], true);
    }

    #[tokio::test]
    async fn malformed_request_with_id_is_answered() {
        let mut host = spawn_host(demo_commands());

        host.sink
            .send(r#"{"id":"req_9","params":{}}"#.to_string())
            .await
            .unwrap();

        let response = next_response(&mut host.stream).await;
        assert_eq!(response["id"], "req_9");
        assert_eq!(response["ok"], false);
        assert!(
            response["error"]
                .as_str()
                .unwrap()
                .starts_with("Malformed request:")
        );
    }

    #[tokio::test]
    async fn garbage_without_id_is_dropped() {
        let mut host = spawn_host(demo_commands());

        host.sink.send("not json at all".to_string()).await.unwrap();
        host.sink
            .send(r#"{"id":"req_1","command":"ping"}"#.to_string())
            .await
            .unwrap();

        let response = next_response(&mut host.stream).await;
        assert_eq!(response["id"], "req_1");
    }

    #[tokio::test]
    async fn slow_command_does_not_block_fast_one() {
        let mut table = demo_commands();
        table.register_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(CommandOutput::unchanged(json!("slow")))
        });
        let mut host = spawn_host(table);

        host.sink
            .send(r#"{"id":"req_1","command":"slow"}"#.to_string())
            .await
            .unwrap();
        host.sink
            .send(r#"{"id":"req_2","command":"ping"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(next_response(&mut host.stream).await["id"], "req_2");
        assert_eq!(next_response(&mut host.stream).await["id"], "req_1");
    }

    #[tokio::test]
    async fn ends_when_bridge_closes() {
        let mut host = spawn_host(demo_commands());

        host.sink.close().await.unwrap();

        host.task.await.unwrap().unwrap();
        assert!(host.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let host = spawn_host(demo_commands());

        host.shutdown.cancel();

        host.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bridge_round_trip_through_host() {
        let ((bridge_sink, bridge_stream), (host_sink, host_stream)) = in_memory();
        let bridge = Bridge::default();
        bridge.attach(bridge_sink, bridge_stream);
        tokio::spawn(serve_connection(
            Dispatcher::new(demo_commands()),
            host_sink,
            host_stream,
            CancellationToken::new(),
        ));

        let response = bridge
            .send("echo", json!({"message": "hi"}))
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.data, Some(json!({"echo": "hi"})));

        let response = bridge.send("unknown.thing", json!({})).await.unwrap();
        assert!(!response.ok);
        assert_eq!(
            response.error.as_deref(),
            Some("Unknown command: unknown.thing")
        );
    }
}
