//! Uniform text-frame view over the WebSocket implementations in use.
//!
//! - **axum**: server side of every listening endpoint
//! - **tokio-tungstenite**: client side of every dialer
//! - **in-memory**: paired channels for tests
//!
//! Control frames (ping/pong/close) are handled here and never reach the
//! bridge. Binary frames are read as UTF-8 (lossy) so a peer that sends JSON
//! as binary still works; anything else fails to decode downstream.

use std::pin::Pin;

use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

/// Outbound half: one `String` per text frame.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: one `String` per data frame, ending when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Split an upgraded axum socket into frame halves.
pub fn from_axum(socket: axum::extract::ws::WebSocket) -> (FrameSink, FrameStream) {
    use axum::extract::ws::Message;

    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(TransportError::new)
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
            Err(e) => Some(Err(TransportError::new(e))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

/// Split a tokio-tungstenite socket (client or server side) into frame halves.
pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    use tokio_tungstenite::tungstenite::Message;

    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(TransportError::new)
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_)) => {
                None
            }
            Err(e) => Some(Err(TransportError::new(e))),
        })
    });

    (Box::pin(sink), Box::pin(stream))
}

/// Two connected in-memory endpoints: frames sent on one half arrive on the other.
///
/// Closing a sink ends the opposite stream, like a WebSocket close.
pub fn in_memory() -> ((FrameSink, FrameStream), (FrameSink, FrameStream)) {
    let (a_tx, a_rx) = futures::channel::mpsc::unbounded::<String>();
    let (b_tx, b_rx) = futures::channel::mpsc::unbounded::<String>();

    let a_sink: FrameSink = Box::pin(a_tx.sink_map_err(TransportError::new));
    let b_sink: FrameSink = Box::pin(b_tx.sink_map_err(TransportError::new));
    let a_stream: FrameStream = Box::pin(b_rx.map(Ok));
    let b_stream: FrameStream = Box::pin(a_rx.map(Ok));

    ((a_sink, a_stream), (b_sink, b_stream))
}
