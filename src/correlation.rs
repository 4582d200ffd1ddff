//! Correlation table: request id -> waiting caller.
//!
//! Every entry is removed exactly once. Whoever removes it (the response
//! dispatcher, the timeout, or a dropped request future) owns the outcome;
//! everyone else finds nothing and does nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::ResponseEnvelope;
use crate::error::{Error, Result};
use crate::model::{AwaitingState, Status};

struct Pending {
    state: AwaitingState,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, Pending>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter under `key`. Must happen before the request becomes
    /// visible to workers.
    pub fn register(
        &self,
        key: &str,
        state: AwaitingState,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(Error::Other(format!("request id collision: {key}")));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(key.to_string(), Pending { state, tx });
        debug!(request_id = key, pending = entries.len(), "registered pending request");
        Ok(rx)
    }

    /// Remove the entry without resolving it. Returns its state if this call
    /// was the one that removed it.
    pub fn cancel(&self, key: &str) -> Option<AwaitingState> {
        self.entries.lock().remove(key).map(|pending| pending.state)
    }

    /// Decode an inbound response and resolve its waiter.
    ///
    /// Malformed messages and responses with no waiter (timed out, foreign,
    /// duplicate) are dropped. Returns whether a waiter was resolved.
    pub fn dispatch(&self, message: &[u8]) -> bool {
        let response = match ResponseEnvelope::decode(message) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "dropping malformed response");
                return false;
            }
        };
        self.resolve(response)
    }

    /// Resolve the waiter for `response`, if one is still registered.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let key = response.request_id.to_hex();
        // Remove before delivering so a concurrent timeout sees nothing.
        let Some(pending) = self.entries.lock().remove(&key) else {
            debug!(request_id = %key, "no pending request for response, dropping");
            return false;
        };
        let outcome = classify(response, pending.state);
        // The receiver may already be gone if the request future was dropped.
        let _ = pending.tx.send(outcome);
        true
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }
}

fn classify(response: ResponseEnvelope, state: AwaitingState) -> Result<Value> {
    match response.status() {
        Some(Status::Success) => Ok(response.result.unwrap_or(Value::Null)),
        Some(Status::Rejected) => Err(Error::Rejected {
            state,
            status: response.status,
        }),
        Some(Status::UnknownMethod) => Err(Error::UnknownMethod { state }),
        None => Err(Error::Protocol(format!(
            "unknown response status {} for {state}",
            response.status
        ))),
    }
}

/// Removes its entry on drop, so a request future that is cancelled by the
/// host does not leave a waiter behind.
pub(crate) struct PendingGuard {
    table: Arc<CorrelationTable>,
    key: String,
}

impl PendingGuard {
    pub(crate) fn new(table: Arc<CorrelationTable>, key: String) -> Self {
        Self { table, key }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.cancel(&self.key);
    }
}
