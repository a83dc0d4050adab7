//! Connection slot: at most one active peer connection per bridge.
//!
//! Lifecycle: `absent -> open -> absent`. Installing a new connection while one
//! is open evicts the old one (last writer wins). Each installed connection
//! owns its own pending table, so teardown of one incarnation never touches
//! requests issued on another.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::CloseReason;
use super::pending::PendingTable;
use super::protocol::ConnectionId;
use crate::transport::FrameSink;

/// One connection incarnation: outbound queue, pending table, teardown signal.
pub(crate) struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingTable,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
            pending: PendingTable::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queue one complete frame for the writer task.
    pub(crate) fn enqueue(&self, frame: String) -> Result<(), CloseReason> {
        self.outbound.send(frame).map_err(|_| {
            self.pending
                .close_reason()
                .unwrap_or(CloseReason::Transport("writer task gone".to_string()))
        })
    }

    /// Fail every pending request with `reason` and signal both I/O tasks to stop.
    ///
    /// Idempotent; the first reason sticks.
    pub(crate) fn close(&self, reason: CloseReason) -> usize {
        let failed = self.pending.close(reason);
        self.shutdown.cancel();
        failed
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.pending.close_reason()
    }
}

#[derive(Default)]
pub(crate) struct ConnectionSlot {
    current: StdMutex<Option<Arc<Connection>>>,
}

impl ConnectionSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Connection slot mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Make `conn` the active connection, returning the one it replaced.
    ///
    /// The caller closes the returned connection; closing happens outside the
    /// slot lock.
    pub(crate) fn install(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.lock().replace(conn)
    }

    /// The active connection, if it is still open.
    pub(crate) fn current(&self) -> Option<Arc<Connection>> {
        self.lock().as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Clear the slot only if it still holds incarnation `id`.
    pub(crate) fn clear_if(&self, id: ConnectionId) -> bool {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|c| c.id() == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn take(&self) -> Option<Arc<Connection>> {
        self.lock().take()
    }
}

/// Drain the outbound queue into the transport until the connection shuts down.
///
/// A write failure closes the connection, which fails all of its pending
/// requests. On exit the sink is closed so the peer sees a close frame.
pub(crate) async fn run_writer(
    conn: Arc<Connection>,
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let shutdown = conn.shutdown_token();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(connection_id = %conn.id(), error = %e, "Failed to write frame");
                    conn.close(CloseReason::Transport(e.to_string()));
                    break;
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Error closing transport");
    }
    tracing::trace!(connection_id = %conn.id(), "Writer task exiting");
}
