//! Correlation of outstanding requests with their callers.
//!
//! Each request registers a single-use completion slot under a fresh id. The
//! read loop resolves slots as responses arrive, in whatever order the server
//! sends them. A slot is removed exactly once: by its response, by the caller
//! abandoning it (timeout or cancellation), or by the table being closed.

use super::error::ClientError;
use crate::infrastructure::rpc::RpcError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// What a slot resolves to: the server's answer (success or RPC error), or a
/// client-side failure.
pub type CallOutcome = Result<Result<Value, RpcError>, ClientError>;

struct PendingCall {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
struct Table {
    calls: HashMap<u64, PendingCall>,
    closed: Option<ClientError>,
}

pub struct PendingCalls {
    next_id: AtomicU64,
    table: Mutex<Table>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id and its slot. Fails once the table has been closed so
    /// that no caller can wait on a connection that is already gone.
    pub fn register(&self, method: &str) -> Result<PendingSlot<'_>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        if let Some(reason) = &table.closed {
            return Err(reason.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                slot: tx,
            },
        );
        Ok(PendingSlot {
            table: self,
            id,
            receiver: rx,
        })
    }

    /// Delivers `outcome` to the caller waiting on `id`.
    ///
    /// Returns `false` when no such call is pending, e.g. a late response to
    /// a call that already timed out.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let call = self.lock().calls.remove(&id);
        match call {
            Some(call) => {
                // the receiver may have been dropped in the meantime
                let _ = call.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Removes a call without resolving it. Returns its method and age.
    pub fn abandon(&self, id: u64) -> Option<(String, Duration)> {
        self.lock()
            .calls
            .remove(&id)
            .map(|call| (call.method, call.created_at.elapsed()))
    }

    /// Fails every outstanding call with `reason` and refuses new ones.
    /// Returns how many calls were resolved.
    pub fn close(&self, reason: ClientError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.calls.drain().map(|(_, call)| call).collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.slot.send(Err(reason.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn method_of(&self, id: u64) -> Option<String> {
        self.lock().calls.get(&id).map(|call| call.method.clone())
    }
}

/// Caller's side of a pending call. Dropping it abandons the call, so a
/// cancelled or timed-out request never leaks its table entry.
pub struct PendingSlot<'a> {
    table: &'a PendingCalls,
    id: u64,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl PendingSlot<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the slot to be written. `None` if the entry vanished without
    /// an outcome.
    pub async fn wait(&mut self) -> Option<CallOutcome> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.table.abandon(self.id);
    }
}
