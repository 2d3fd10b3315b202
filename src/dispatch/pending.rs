//! Requests awaiting a correlated response
//!
//! Both the response path and the timeout path `remove` under the same lock,
//! so exactly one of them completes a request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::connection::lock;
use crate::error::{Error, Result};
use crate::message::HtspMessage;

/// A request awaiting its response
pub(crate) struct PendingRequest {
    pub response_tx: oneshot::Sender<Result<HtspMessage>>,
    pub created_at: Instant,
}

/// Correlation table keyed by `seq`
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: Mutex<HashMap<u32, PendingRequest>>,
}

impl PendingRequests {
    /// Register `seq`; the receiver yields the response or a failure
    pub fn add(&self, seq: u32) -> oneshot::Receiver<Result<HtspMessage>> {
        let (tx, rx) = oneshot::channel();
        let previous = lock(&self.requests).insert(
            seq,
            PendingRequest {
                response_tx: tx,
                created_at: Instant::now(),
            },
        );
        if previous.is_some() {
            // Sequence wrapped onto a request that never completed
            tracing::warn!(seq = seq, "Replaced stale pending request");
        }
        rx
    }

    /// Complete `seq` with `response`. Returns `false` if nobody is waiting.
    pub fn resolve(&self, seq: u32, response: HtspMessage) -> bool {
        let Some(pending) = lock(&self.requests).remove(&seq) else {
            return false;
        };
        tracing::trace!(
            seq = seq,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "Resolved pending request"
        );
        // Receiver may have given up already
        let _ = pending.response_tx.send(Ok(response));
        true
    }

    /// Forget `seq` without notifying. Returns whether it was still pending.
    pub fn remove(&self, seq: u32) -> bool {
        lock(&self.requests).remove(&seq).is_some()
    }

    /// Fail every pending request with `NotConnected`
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.requests).drain().collect();
        let count = drained.len();
        for (_, pending) in drained {
            let _ = pending.response_tx.send(Err(Error::NotConnected));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.requests).len()
    }
}
