use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::CallOutcome;
use crate::token::TokenPool;

/// One in-flight call awaiting resolution or expiry
///
/// Owned exclusively by the tracker from registration until exactly one of
/// {reply received, deadline elapsed, connection lost} occurs.
struct PendingCall {
    /// Single-use completion channel back to the waiting caller
    complete: oneshot::Sender<CallOutcome>,
    /// Rename token held by the request's claimed asset
    asset_token: String,
    /// When the call was registered
    created_at: DateTime<Utc>,
    /// Deadline measured from registration
    deadline: Duration,
}

/// Correlation table mapping identifiers to pending callers
///
/// Resolution and expiry are mutually exclusive: whichever removes the entry
/// first delivers the outcome, and any later resolve or expire for the same
/// identifier is a no-op. Entry removal also hands both of the request's
/// tokens back to the pool, so no outcome path can leak them.
pub struct RequestTracker {
    pending: Mutex<HashMap<String, PendingCall>>,
    tokens: Arc<TokenPool>,
    registered: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
    failed: AtomicU64,
}

impl RequestTracker {
    /// Create a tracker releasing tokens into the given pool
    pub fn new(tokens: Arc<TokenPool>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            tokens,
            registered: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Register a pending call and hand back its completion channel
    ///
    /// The identifier and the asset token are owned by the tracker from here
    /// on; they are released when the entry is removed.
    pub async fn register(
        &self,
        id: String,
        asset_token: String,
        deadline: Duration,
    ) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            complete: tx,
            asset_token,
            created_at: Utc::now(),
            deadline,
        };

        let mut pending = self.pending.lock().await;
        debug_assert!(!pending.contains_key(&id), "duplicate pending id");
        pending.insert(id.clone(), call);
        self.registered.fetch_add(1, Ordering::Relaxed);

        debug!("registered call {} (deadline {:?})", id, deadline);
        rx
    }

    /// Deliver a backend reply to the matching caller
    ///
    /// Returns true when a pending entry was completed. A reply for an
    /// identifier that was already resolved or expired is discarded.
    pub async fn resolve(&self, id: &str, payload: Value) -> bool {
        let Some(call) = self.remove(id).await else {
            debug!("discarding reply for unknown or completed call {}", id);
            return false;
        };

        self.resolved.fetch_add(1, Ordering::Relaxed);
        let waited = Utc::now() - call.created_at;
        info!("call {} resolved after {}ms", id, waited.num_milliseconds());

        // The receiver may have gone away; nothing left to deliver to.
        let _ = call.complete.send(CallOutcome::Reply(payload));
        true
    }

    /// Expire a pending call whose deadline elapsed
    ///
    /// A no-op if the call was resolved in the meantime.
    pub async fn expire(&self, id: &str) -> bool {
        let Some(call) = self.remove(id).await else {
            return false;
        };

        self.expired.fetch_add(1, Ordering::Relaxed);
        warn!("call {} timed out after {:?}", id, call.deadline);

        let _ = call.complete.send(CallOutcome::TimedOut);
        true
    }

    /// Fail every pending call, e.g. when the backend connection drops
    ///
    /// Returns the number of callers unblocked.
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };

        for (id, call) in &drained {
            self.tokens.release(id).await;
            self.tokens.release(&call.asset_token).await;
        }

        let count = drained.len();
        if count > 0 {
            self.failed.fetch_add(count as u64, Ordering::Relaxed);
            warn!("failing {} in-flight call(s)", count);
            for (_, call) in drained {
                let _ = call.complete.send(CallOutcome::Disconnected);
            }
        }
        count
    }

    /// Remove a pending call without completing it
    ///
    /// Used when the send itself fails and the orchestrator reports the error
    /// directly; the entry's tokens are still released.
    pub async fn discard(&self, id: &str) -> bool {
        self.remove(id).await.is_some()
    }

    /// Number of calls currently in flight
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Snapshot of lifetime counters plus the current in-flight count
    pub async fn stats(&self) -> TrackerStats {
        TrackerStats {
            registered: self.registered.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.pending.lock().await.len(),
        }
    }

    /// Remove the entry for `id` and release both of its tokens
    ///
    /// Single point of removal: the first of resolve/expire/discard to get
    /// here wins, later callers see an empty slot.
    async fn remove(&self, id: &str) -> Option<PendingCall> {
        let call = self.pending.lock().await.remove(id)?;
        self.tokens.release(id).await;
        self.tokens.release(&call.asset_token).await;
        Some(call)
    }
}

/// Lifetime counters of the correlation table
#[derive(Debug, Default, Clone, Serialize)]
pub struct TrackerStats {
    pub registered: u64,
    pub resolved: u64,
    pub expired: u64,
    pub failed: u64,
    pub in_flight: usize,
}

impl std::fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "calls: registered={}, resolved={}, expired={}, failed={}, in_flight={}",
            self.registered, self.resolved, self.expired, self.failed, self.in_flight
        )
    }
}
