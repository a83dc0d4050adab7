//! Dialer form: the controller side connects out to a listening peer or relay.
//!
//! The connect attempt is bounded by its own timeout, distinct from per-request
//! timeouts. There is no internal reconnect; callers that want one wrap
//! [`dial`] in their own loop.

use std::time::Duration;

use tracing::info;

use super::frame::{self, FrameSink, FrameStream};
use crate::bridge::{Bridge, ConnectionHandle};
use crate::config::env_millis;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DialConfig {
    pub connect_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl DialConfig {
    /// Defaults overridden by `EASEL_CONNECT_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_millis("EASEL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connecting to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
}

/// Open a WebSocket to `url`, failing if the handshake takes longer than `connect_timeout`.
pub async fn connect(
    url: &str,
    connect_timeout: Duration,
) -> Result<(FrameSink, FrameStream), DialError> {
    let handshake = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url));

    let (ws, response) = handshake
        .await
        .map_err(|_| DialError::Timeout {
            url: url.to_string(),
            timeout: connect_timeout,
        })?
        .map_err(|e| DialError::Connect {
            url: url.to_string(),
            source: Box::new(e),
        })?;

    tracing::debug!(url, status = %response.status(), "WebSocket handshake complete");
    Ok(frame::from_tungstenite(ws))
}

/// Connect to `url` and attach the connection to `bridge`.
pub async fn dial(
    bridge: &Bridge,
    url: &str,
    config: &DialConfig,
) -> Result<ConnectionHandle, DialError> {
    let (sink, stream) = connect(url, config.connect_timeout).await?;
    let handle = bridge.attach(sink, stream);
    info!(url, connection_id = %handle.id(), "Dialed peer");
    Ok(handle)
}
