//! Pending-request table: in-flight request ids mapped to their waiting callers.
//!
//! One table per connection incarnation. Every entry is removed exactly once,
//! by whichever comes first: matching response, expiry, or connection close.
//! Closing the table is sticky, so a registration racing the close is rejected
//! instead of waiting forever.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Instant;

use tokio::sync::oneshot;

use super::CloseReason;
use super::protocol::{RequestId, Response};

/// What a waiting caller eventually receives.
pub(crate) type Outcome = Result<Response, CloseReason>;

struct PendingEntry {
    command: String,
    registered_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<RequestId, PendingEntry>,
    closed: Option<CloseReason>,
}

#[derive(Default)]
pub struct PendingTable {
    state: StdMutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pending table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a waiter for `id`. Fails with the close reason once the table is closed.
    pub(crate) fn register(
        &self,
        id: RequestId,
        command: &str,
    ) -> Result<oneshot::Receiver<Outcome>, CloseReason> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }

        let (tx, rx) = oneshot::channel();
        let previous = state.entries.insert(
            id.clone(),
            PendingEntry {
                command: command.to_string(),
                registered_at: Instant::now(),
                tx,
            },
        );
        debug_assert!(previous.is_none(), "duplicate pending request id {id}");
        Ok(rx)
    }

    /// Hand `response` to the caller waiting on its id.
    ///
    /// Returns the response back when nothing is waiting for it (expired,
    /// already resolved, or from an earlier connection).
    pub fn resolve(&self, response: Response) -> Result<(), Response> {
        let entry = self.lock().entries.remove(&response.id);
        let Some(entry) = entry else {
            return Err(response);
        };

        tracing::trace!(
            request_id = %response.id,
            command = %entry.command,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "Resolving pending request"
        );
        if entry.tx.send(Ok(response)).is_err() {
            tracing::debug!(command = %entry.command, "Caller gone before response delivery");
        }
        Ok(())
    }

    /// Remove the entry for `id` without resolving it. Returns whether it existed.
    pub fn expire(&self, id: &RequestId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Close the table and fail every waiter with `reason`.
    ///
    /// Only the first close takes effect. Returns the number of waiters failed.
    pub(crate) fn close(&self, reason: CloseReason) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return 0;
            }
            state.closed = Some(reason.clone());
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let failed = drained.len();
        for entry in drained {
            tracing::debug!(command = %entry.command, %reason, "Failing pending request");
            let _ = entry.tx.send(Err(reason.clone()));
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending entry on drop unless disarmed.
///
/// Covers callers whose `send` future is dropped mid-flight and the timeout path.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: Option<RequestId>,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: RequestId) -> Self {
        Self {
            table,
            id: Some(id),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.table.expire(&id);
        }
    }
}
