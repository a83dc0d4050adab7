//! Health status types for the listener's `/health` endpoint.

use serde::Serialize;

use crate::bridge::protocol::ConnectionId;
use crate::version::VersionInfo;

/// Whether a host peer currently occupies the connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    /// No peer attached; calls fail with `NotConnected`.
    Waiting,
    /// A peer is attached and can serve calls.
    Connected,
}

/// Point-in-time view of a bridge, serialized as the `/health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: PeerStatus,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionId>,
    pub version: VersionInfo,
}
