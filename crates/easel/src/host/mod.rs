//! Host side: the process that owns the document and executes commands.
//!
//! - [`dispatch`]: command table and the never-failing dispatch boundary
//! - [`peer`]: connection runtime (dial-out with reconnect, or listen)
//! - [`demo`]: `echo` / `ping` commands for wiring checks

pub mod demo;
pub mod dispatch;
pub mod peer;

use std::time::Duration;

use crate::config::{env_millis, env_string};
use crate::transport::dialer::DEFAULT_CONNECT_TIMEOUT;

pub use dispatch::{CommandHandler, CommandOutput, CommandTable, Dispatcher, HandlerError};
pub use peer::{run_host, serve_connection, serve_listener};

pub const DEFAULT_HOST_URL: &str = "ws://127.0.0.1:8765/";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Bridge (or relay) endpoint to dial.
    pub url: String,
    pub connect_timeout: Duration,
    /// Fixed wait between a lost connection and the next dial.
    pub reconnect_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HOST_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `EASEL_URL`, `EASEL_CONNECT_TIMEOUT_MS` and
    /// `EASEL_RECONNECT_DELAY_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(url) = env_string("EASEL_URL") {
            config.url = url;
        }
        if let Some(timeout) = env_millis("EASEL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        if let Some(delay) = env_millis("EASEL_RECONNECT_DELAY_MS") {
            config.reconnect_delay = delay;
        }
        config
    }
}
