//! easel: request/response bridge between an LLM controller and an image-editor host.

mod config;
mod health;
mod version;

pub mod bridge;
pub mod host;
pub mod relay;
pub mod transport;

pub use bridge::protocol::{Artifacts, ConnectionId, Request, RequestId, Response};
pub use bridge::{
    Bridge, BridgeConfig, BridgeError, CloseReason, ConnectionHandle, DEFAULT_REQUEST_TIMEOUT,
};
pub use health::{HealthSnapshot, PeerStatus};
pub use host::{
    CommandHandler, CommandOutput, CommandTable, Dispatcher, HandlerError, HostConfig,
};
pub use relay::{Relay, RelayConfig, RelayRole};
pub use transport::{DialConfig, DialError, ListenerConfig};
pub use version::{EASEL_VERSION, VersionInfo};
