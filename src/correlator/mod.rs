//! Request/acknowledgement correlation for outbound mutations.
//!
//! Every mutation registers a pending entry keyed by its correlation id. The
//! entry leaves the pending set exactly once: when a matching `server:ack`
//! arrives or when its timer fires, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::protocol::AckEnvelope;

pub mod publisher;

pub use publisher::MutationPublisher;

/// Acknowledgement delivered to the caller of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub request_id: String,
    /// The whole `server:ack` frame.
    pub payload: Value,
    /// Time from registration to acknowledgement.
    pub latency: Duration,
}

/// Resolves once the mutation is acknowledged or times out.
pub type AckFuture = BoxFuture<'static, Result<Ack>>;

struct PendingRequest {
    reply: oneshot::Sender<Result<Ack>>,
    submitted_at: Instant,
    timer: JoinHandle<()>,
}

type PendingMap = HashMap<String, PendingRequest>;

/// Pending-request table shared by a session and its publisher.
#[derive(Clone)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<PendingMap>>,
    timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register `request_id` and return the future of its acknowledgement.
    ///
    /// Must be called within a Tokio runtime; the timeout runs as a task.
    pub fn register(&self, request_id: &str) -> AckFuture {
        let (reply, receiver) = oneshot::channel();
        {
            // The timer cannot expire the entry before it is inserted: it
            // needs this lock.
            let mut pending = self.lock();
            let timer = tokio::spawn(expire_after(
                self.pending.clone(),
                request_id.to_string(),
                self.timeout,
            ));
            let previous = pending.insert(
                request_id.to_string(),
                PendingRequest {
                    reply,
                    submitted_at: Instant::now(),
                    timer,
                },
            );
            if let Some(previous) = previous {
                warn!(request_id = %request_id, "Duplicate correlation id replaced");
                previous.timer.abort();
            }
        }
        debug!(request_id = %request_id, timeout = ?self.timeout, "Request registered");

        async move { receiver.await.unwrap_or(Err(SyncError::Closed)) }.boxed()
    }

    /// Fulfil the pending entry matching the ack. Returns false for acks
    /// without a correlation id or for ids no longer pending.
    pub fn resolve(&self, ack: &AckEnvelope) -> bool {
        let Some(request_id) = ack.request_id.as_deref() else {
            return false;
        };
        let Some(entry) = self.lock().remove(request_id) else {
            debug!(request_id = %request_id, "Ack for unknown or expired request");
            return false;
        };
        entry.timer.abort();
        let latency = entry.submitted_at.elapsed();
        debug!(request_id = %request_id, latency = ?latency, "Request acknowledged");
        let _ = entry.reply.send(Ok(Ack {
            request_id: request_id.to_string(),
            payload: ack.payload.clone(),
            latency,
        }));
        true
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn expire_after(pending: Arc<Mutex<PendingMap>>, request_id: String, after: Duration) {
    tokio::time::sleep(after).await;
    let entry = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&request_id);
    if let Some(entry) = entry {
        warn!(request_id = %request_id, after = ?after, "Request timed out without acknowledgement");
        let _ = entry
            .reply
            .send(Err(SyncError::Timeout { request_id, after }));
    }
}

#[cfg(test)]
mod tests;
