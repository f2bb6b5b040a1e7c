//! Pending-call table.
//!
//! Every outbound call gets a fresh id and a `oneshot` channel. The sender
//! half lives in the table until the receiver loop fulfils it; the receiver
//! half is awaited by the caller. Removing the entry and sending through it
//! happen together, so an id is answered at most once.
//!
//! A [`PendingCall`] dropped before its reply arrives (a caller that gave
//! up, for instance under `tokio::time::timeout`) removes its own entry.
//!
//! When the connection dies the table is closed: every outstanding sender
//! is dropped (waking its caller with a disconnect) and later calls are
//! refused at registration time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{AppError, Result};

/// Outcome of a completed call: the `(success, values...)` pair.
///
/// On failure `values` holds exactly one entry, the peer's error message.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Whether the peer reported success.
    pub success: bool,
    /// Result values, or the single error message on failure.
    pub values: Vec<Value>,
}

impl CallOutcome {
    /// Successful outcome carrying `values`.
    #[must_use]
    pub fn success(values: Vec<Value>) -> Self {
        Self {
            success: true,
            values,
        }
    }

    /// Failed outcome carrying the peer's error `message`.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            values: vec![Value::String(message.into())],
        }
    }

    /// Error message of a failed outcome.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(match self.values.first() {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
    }

    /// Convert into the result values, or [`AppError::Remote`] on failure.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Remote`] carrying the peer's message when
    /// `success` is false.
    pub fn into_result(self) -> Result<Vec<Value>> {
        match self.error_message() {
            Some(message) => Err(AppError::Remote(message)),
            None => Ok(self.values),
        }
    }
}

/// `None` once the table has been closed.
type Waiters = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<CallOutcome>>>>>;

fn lock(
    waiters: &Waiters,
) -> MutexGuard<'_, Option<HashMap<u64, oneshot::Sender<CallOutcome>>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waiter half of a pending call.
///
/// Dropping it before the reply arrives forgets the call.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<CallOutcome>,
    waiters: Waiters,
}

impl PendingCall {
    /// Id allocated to the call.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the call is fulfilled.
    ///
    /// No timeout is applied; the wait ends with a reply or with connection
    /// loss.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Disconnected`] if the table was closed before a
    /// reply arrived.
    pub async fn wait(mut self) -> Result<CallOutcome> {
        let id = self.id;
        (&mut self.rx).await.map_err(|_| {
            AppError::Disconnected(format!("connection lost while call {id} was pending"))
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // No-op once fulfilled: the entry left the table with its reply.
        if let Some(waiters) = lock(&self.waiters).as_mut() {
            waiters.remove(&self.id);
        }
    }
}

/// Table of outstanding calls keyed by call id.
#[derive(Debug)]
pub struct PendingCalls {
    next_id: AtomicU64,
    waiters: Waiters,
}

impl PendingCalls {
    /// Create an open table whose first id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Arc::new(Mutex::new(Some(HashMap::new()))),
        }
    }

    /// Allocate the next id and record a waiter for it.
    ///
    /// Ids are strictly increasing and never reused.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Disconnected`] if the table has been closed.
    pub fn register(&self) -> Result<PendingCall> {
        let mut guard = lock(&self.waiters);
        let Some(waiters) = guard.as_mut() else {
            return Err(AppError::Disconnected("connection is closed".into()));
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.insert(id, tx);
        Ok(PendingCall {
            id,
            rx,
            waiters: Arc::clone(&self.waiters),
        })
    }

    /// Fulfil call `id` with `outcome`, removing it from the table.
    ///
    /// Returns `false` if no call with that id is pending (a stray or
    /// duplicate reply).
    #[must_use]
    pub fn fulfil(&self, id: u64, outcome: CallOutcome) -> bool {
        let sender = lock(&self.waiters)
            .as_mut()
            .and_then(|waiters| waiters.remove(&id));

        match sender {
            // A dropped receiver means the caller stopped waiting; the id
            // still counts as answered.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Close the table and fail every outstanding call.
    ///
    /// Returns how many callers were released.
    #[must_use]
    pub fn close(&self) -> usize {
        lock(&self.waiters)
            .take()
            .map_or(0, |waiters| waiters.len())
    }

    /// Number of calls currently awaiting a reply.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.waiters).as_ref().map_or(0, HashMap::len)
    }

    /// Whether no call is awaiting a reply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`PendingCalls::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.waiters).is_none()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
