//! Execution cache: pending requests keyed by execution id.
//!
//! The cache is the backpressure authority for a node connection. Its size
//! counter is incremented *before* insertion so concurrent submitters observe
//! capacity promptly, and removal is two-phase: `begin_remove` hands the
//! request out while it is still counted, `end_remove` decrements only after
//! user-visible work (callback delivery) has finished. `drain` watching for
//! size zero therefore waits for callbacks too, not just for responses.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::{Error, Result};

/// Final status of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

/// Opaque caller state carried through to the callback.
pub type UserState = Arc<dyn Any + Send + Sync>;

/// Type-erased completion callback. The typed decode happens inside the
/// closure built at submission time.
pub(crate) type CallbackFn = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

/// The completed form of a request, delivered both through the handle's
/// completion signal and to any registered callback.
pub struct CallOutcome {
    pub execution_id: u64,
    pub procedure: String,
    pub status: CallStatus,
    /// Server-reported execution duration for real responses; elapsed wall
    /// time for timeouts; 0 for aborts.
    pub duration_ms: i32,
    /// Raw result payload on success; the completing error otherwise.
    pub result: Result<Bytes>,
    pub user_state: Option<UserState>,
}

impl Clone for CallOutcome {
    fn clone(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            procedure: self.procedure.clone(),
            status: self.status,
            duration_ms: self.duration_ms,
            result: match &self.result {
                Ok(payload) => Ok(payload.clone()),
                Err(e) => Err(e.duplicate()),
            },
            user_state: self.user_state.clone(),
        }
    }
}

impl fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOutcome")
            .field("execution_id", &self.execution_id)
            .field("procedure", &self.procedure)
            .field("status", &self.status)
            .field("duration_ms", &self.duration_ms)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

/// One submitted, not-yet-completed request. Exclusively owned by the cache
/// between insertion and `begin_remove`.
pub(crate) struct PendingRequest {
    pub execution_id: u64,
    pub procedure: String,
    pub submitted_at: Instant,
    /// `None` means an infinite timeout.
    pub expires_at: Option<Instant>,
    pub completion: oneshot::Sender<CallOutcome>,
    pub callback: Option<CallbackFn>,
    pub user_state: Option<UserState>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("execution_id", &self.execution_id)
            .field("procedure", &self.procedure)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl PendingRequest {
    /// Build the outcome for this request completing with an error.
    pub fn failed_outcome(&self, status: CallStatus, error: Error) -> CallOutcome {
        let duration_ms = match status {
            CallStatus::TimedOut => {
                i32::try_from(self.submitted_at.elapsed().as_millis()).unwrap_or(i32::MAX)
            }
            _ => 0,
        };
        CallOutcome {
            execution_id: self.execution_id,
            procedure: self.procedure.clone(),
            status,
            duration_ms,
            result: Err(error),
            user_state: self.user_state.clone(),
        }
    }
}

/// Bounded concurrent map {execution id → pending request}.
#[derive(Debug, Default)]
pub(crate) struct ExecutionCache {
    entries: Mutex<HashMap<u64, PendingRequest>>,
    size: AtomicU64,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a pending request. The size counter moves before the map does,
    /// so a concurrent submitter at the capacity check sees the slot taken.
    pub fn insert(&self, request: PendingRequest) {
        self.size.fetch_add(1, Ordering::SeqCst);
        self.entries().insert(request.execution_id, request);
    }

    /// First phase of removal: extract the request, leaving it counted.
    /// Exactly one caller wins for a given id; losers get `None`.
    pub fn begin_remove(&self, execution_id: u64) -> Option<PendingRequest> {
        self.entries().remove(&execution_id)
    }

    /// Second phase: release the slot after user-visible completion work.
    pub fn end_remove(&self) {
        self.size.fetch_sub(1, Ordering::SeqCst);
    }

    /// Ids whose deadline is at or before `now`.
    pub fn expired_ids(&self, now: Instant) -> Vec<u64> {
        self.entries()
            .values()
            .filter(|r| r.expires_at.is_some_and(|deadline| deadline <= now))
            .map(|r| r.execution_id)
            .collect()
    }

    /// Remove every entry at once (terminal failure path). Entries stay
    /// counted until the caller `end_remove`s each one.
    pub fn drain_all(&self) -> Vec<PendingRequest> {
        self.entries().drain().map(|(_, r)| r).collect()
    }

    /// Current number of counted slots, including removals still in their
    /// first phase.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }
}
