//! Connections: one socket per node, a pool of nodes per cluster.
//!
//! `NodeConnection` owns a single framed byte stream and the workers around
//! it (receive loop, timeout sweeper). `ClusterConnection` layers batched
//! round-robin dispatch, identity consistency checks and background
//! reconnection over a pool of node connections.

mod cluster;
mod node;

pub use cluster::ClusterConnection;
pub use node::{NodeConnection, NodeInfo};

use std::fmt;

use crate::cache::{CallOutcome, CallStatus, UserState};
use crate::types::{Error, Result};
use crate::wire::values::ResultShape;

/// Connection lifecycle states.
///
/// `Closed → Connecting → Connected → (Draining ⇄ Connected) → Closing →
/// Closed`; a fatal I/O error drops `Connected` straight back to `Closed`
/// with the first error retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Connected,
    Draining,
    Closing,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Draining => "draining",
            ConnectionStatus::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Per-call options for `begin_execute`.
///
/// `timeout_ms` semantics: `0` uses the connection default, `-1` means
/// infinite, any other negative value is rejected with `BadArgument`.
pub struct CallOptions<R: ResultShape> {
    pub timeout_ms: i64,
    pub user_state: Option<UserState>,
    pub callback: Option<ResponseCallback<R>>,
}

impl<R: ResultShape> Default for CallOptions<R> {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            user_state: None,
            callback: None,
        }
    }
}

impl<R: ResultShape> fmt::Debug for CallOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("has_user_state", &self.user_state.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Completion callback for one call. Invoked exactly once with the final
/// response, whatever the outcome.
pub type ResponseCallback<R> = Box<dyn FnOnce(Response<R>) + Send + 'static>;

/// The completed form of a call, decoded to the caller's result shape.
pub struct Response<R> {
    pub execution_id: u64,
    pub procedure: String,
    pub status: CallStatus,
    /// Server-reported execution duration for real responses, elapsed wall
    /// time for timeouts.
    pub duration_ms: i32,
    pub result: Result<R>,
    pub user_state: Option<UserState>,
}

impl<R> fmt::Debug for Response<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("execution_id", &self.execution_id)
            .field("procedure", &self.procedure)
            .field("status", &self.status)
            .field("duration_ms", &self.duration_ms)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}

impl<R: ResultShape> Response<R> {
    pub(crate) fn from_outcome(outcome: CallOutcome) -> Self {
        let result = match outcome.result {
            Ok(payload) => R::decode(payload),
            Err(e) => Err(e),
        };
        Self {
            execution_id: outcome.execution_id,
            procedure: outcome.procedure,
            status: outcome.status,
            duration_ms: outcome.duration_ms,
            result,
            user_state: outcome.user_state,
        }
    }

    /// Raise the response's error if the call did not succeed.
    pub fn into_result(self) -> Result<Response<R>> {
        if let Err(e) = &self.result {
            return Err(e.duplicate());
        }
        Ok(self)
    }
}

/// Client-side handle for an outstanding call.
///
/// Await completion with [`CallHandle::wait`]; abort with
/// [`CallHandle::cancel`] (also reachable through the owning connection's
/// `cancel`).
#[derive(Debug)]
pub struct CallHandle<R: ResultShape> {
    execution_id: u64,
    origin: NodeConnection,
    rx: tokio::sync::oneshot::Receiver<CallOutcome>,
    _shape: std::marker::PhantomData<fn() -> R>,
}

impl<R: ResultShape> CallHandle<R> {
    pub(crate) fn new(
        execution_id: u64,
        origin: NodeConnection,
        rx: tokio::sync::oneshot::Receiver<CallOutcome>,
    ) -> Self {
        Self {
            execution_id,
            origin,
            rx,
            _shape: std::marker::PhantomData,
        }
    }

    /// Id correlating this handle with its response frame on its node
    /// connection. Unique per node, not across a cluster.
    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    /// The node connection this call was dispatched to.
    pub fn origin(&self) -> &NodeConnection {
        &self.origin
    }

    /// Client-side abort. Returns `true` when the pending request was still
    /// in the cache; the handle then resolves with status `Aborted`.
    pub async fn cancel(&self) -> bool {
        self.origin.cancel_by_id(self.execution_id).await
    }

    /// Block until the call completes; raise its error if it did not
    /// succeed.
    pub async fn wait(self) -> Result<Response<R>> {
        let outcome = self
            .rx
            .await
            .map_err(|_| Error::connection_lost("connection dropped the pending call"))?;
        Response::from_outcome(outcome).into_result()
    }
}
