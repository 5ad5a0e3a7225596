//! Cluster connection: a pool of node connections behind one dispatch
//! surface.
//!
//! Opens children in parallel, enforces a single cluster identity across the
//! pool, load-balances dispatch in batches over the live set, and keeps a
//! background task per dead child trying to bring it back. The pool itself
//! is fixed after open; only the live set changes, replaced wholesale as an
//! immutable sequence so dispatch reads stay cheap.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::join_all;

use crate::callbacks::CallbackExecutor;
use crate::connection::{
    CallHandle, CallOptions, ConnectionStatus, NodeConnection, Response,
};
use crate::observability::event;
use crate::types::{ConnectionSettings, Error, Result};
use crate::wire::protocol::ClusterIdentity;
use crate::wire::values::{ParamPack, ResultShape};

/// Upper bound on concurrently-opening children during cluster open. Bounds
/// resources, not ordering.
const OPEN_BATCH_SIZE: usize = 16;

pub(crate) struct ClusterInner {
    settings: ConnectionSettings,
    state: Mutex<ConnectionStatus>,
    pool: RwLock<Vec<NodeConnection>>,
    live: RwLock<Arc<Vec<usize>>>,
    identity: Mutex<Option<ClusterIdentity>>,
    sequence: AtomicU64,
    executor: Arc<CallbackExecutor>,
    reconnecting: Mutex<HashSet<usize>>,
}

impl std::fmt::Debug for ClusterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInner")
            .field("state", &self.status())
            .field("live", &self.live_indices().len())
            .finish()
    }
}

impl ClusterInner {
    fn status(&self) -> ConnectionStatus {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn live_indices(&self) -> Arc<Vec<usize>> {
        Arc::clone(&self.live.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn pool_entry(&self, index: usize) -> Option<NodeConnection> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    fn pool_snapshot(&self) -> Vec<NodeConnection> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn identity(&self) -> Option<ClusterIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Seed the identity from the first child, or reject a mismatch.
    fn check_identity(&self, candidate: &ClusterIdentity, endpoint: SocketAddr) -> Result<()> {
        let mut slot = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            None => {
                *slot = Some(candidate.clone());
                Ok(())
            }
            Some(expected) if expected == candidate => Ok(()),
            Some(expected) => Err(Error::inconsistent_cluster(format!(
                "{} reports build {} / start {} / leader {}, expected build {} / start {} / leader {}",
                endpoint,
                candidate.build_string,
                candidate.cluster_start_timestamp,
                candidate.leader_endpoint,
                expected.build_string,
                expected.cluster_start_timestamp,
                expected.leader_endpoint,
            ))),
        }
    }

    /// Drop a child from the live set. Returns true if it was present.
    fn remove_live(&self, index: usize) -> bool {
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        if !live.contains(&index) {
            return false;
        }
        let next: Vec<usize> = live.iter().copied().filter(|&i| i != index).collect();
        *live = Arc::new(next);
        true
    }

    fn add_live(&self, index: usize) {
        let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
        if live.contains(&index) {
            return;
        }
        let mut next: Vec<usize> = live.iter().copied().collect();
        next.push(index);
        next.sort_unstable();
        *live = Arc::new(next);
    }
}

/// Connection to a cluster of server nodes.
#[derive(Debug, Clone)]
pub struct ClusterConnection {
    inner: Arc<ClusterInner>,
}

impl ClusterConnection {
    pub(crate) fn new(settings: ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                settings,
                state: Mutex::new(ConnectionStatus::Closed),
                pool: RwLock::new(Vec::new()),
                live: RwLock::new(Arc::new(Vec::new())),
                identity: Mutex::new(None),
                sequence: AtomicU64::new(0),
                executor: Arc::new(CallbackExecutor::new()),
                reconnecting: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Number of children currently eligible for dispatch.
    pub fn connection_count(&self) -> usize {
        self.inner.live_indices().len()
    }

    /// Identity triple learned from the first child.
    pub fn identity(&self) -> Option<ClusterIdentity> {
        self.inner.identity()
    }

    /// Clones of every pooled child, live or not.
    pub fn children(&self) -> Vec<NodeConnection> {
        self.inner.pool_snapshot()
    }

    /// Open every resolved endpoint in bounded parallel batches.
    pub async fn open(&self) -> Result<()> {
        if !self
            .inner
            .transition(ConnectionStatus::Closed, ConnectionStatus::Connecting)
        {
            return Err(Error::invalid_state(format!(
                "cannot open cluster: state is {}",
                self.status()
            )));
        }
        match self.open_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.set_status(ConnectionStatus::Closed);
                Err(e)
            }
        }
    }

    async fn open_inner(&self) -> Result<()> {
        let endpoints = self.inner.settings.resolve_endpoints()?;
        let mut opened: Vec<NodeConnection> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for batch in endpoints.chunks(OPEN_BATCH_SIZE) {
            let children: Vec<NodeConnection> = batch
                .iter()
                .map(|&endpoint| {
                    NodeConnection::new(
                        self.inner.settings.clone(),
                        endpoint,
                        Some(Arc::clone(&self.inner.executor)),
                    )
                })
                .collect();

            let aggregate_timeout =
                self.inner.settings.connection_timeout() * batch.len().max(1) as u32;
            let results = tokio::time::timeout(
                aggregate_timeout,
                join_all(children.iter().map(|child| child.open())),
            )
            .await;

            let results = match results {
                Ok(results) => results,
                Err(_) => {
                    for child in &children {
                        let _ = child.close(false).await;
                    }
                    for endpoint in batch {
                        failures.push(format!("{}: batch open timed out", endpoint));
                    }
                    continue;
                }
            };

            for (child, result) in children.into_iter().zip(results) {
                match result {
                    Ok(()) => {
                        let Some(handshake) = child.handshake() else {
                            failures.push(format!("{}: handshake missing", child.endpoint()));
                            let _ = child.close(false).await;
                            continue;
                        };
                        match self
                            .inner
                            .check_identity(&handshake.identity, child.endpoint())
                        {
                            Ok(()) => opened.push(child),
                            Err(e) => {
                                failures.push(format!("{}: {}", child.endpoint(), e));
                                let _ = child.close(false).await;
                            }
                        }
                    }
                    Err(e) => failures.push(format!("{}: {}", child.endpoint(), e)),
                }
            }
        }

        if self.inner.settings.connect_to_all_or_none && !failures.is_empty() {
            for child in &opened {
                let _ = child.close(false).await;
            }
            return Err(Error::cluster_connection_failure(format!(
                "connect_to_all_or_none violated: {}",
                failures.join("; ")
            )));
        }
        if opened.is_empty() {
            return Err(Error::no_live_connections(format!(
                "no host could be reached: {}",
                failures.join("; ")
            )));
        }

        let live: Vec<usize> = (0..opened.len()).collect();
        *self.inner.pool.write().unwrap_or_else(|e| e.into_inner()) = opened;
        *self.inner.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(live);
        self.inner.set_status(ConnectionStatus::Connected);
        tracing::info!(
            event = event::CONNECTION_OPENED,
            children = self.connection_count(),
            failed = failures.len(),
            "cluster opened"
        );
        Ok(())
    }

    /// Pick the child for the next dispatch: batched round-robin over the
    /// live set, skipping (and reaping) children that died since the last
    /// refresh.
    fn select_child(&self) -> Result<NodeConnection> {
        loop {
            if self.status() != ConnectionStatus::Connected {
                return Err(Error::invalid_state(format!(
                    "cannot dispatch on {} cluster",
                    self.status()
                )));
            }
            let live = self.inner.live_indices();
            if live.is_empty() {
                self.inner.set_status(ConnectionStatus::Closed);
                return Err(Error::no_live_connections(
                    "every child connection is down",
                ));
            }
            let seq = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
            let slot =
                (seq / self.inner.settings.load_balancing_batch_size) as usize % live.len();
            let index = live[slot];
            let Some(child) = self.inner.pool_entry(index) else {
                return Err(Error::no_live_connections("pool entry vanished"));
            };
            if child.is_connected() {
                return Ok(child);
            }
            self.mark_dead(index);
        }
    }

    /// Remove a dead child from the live set and queue its reconnection.
    fn mark_dead(&self, index: usize) {
        if !self.inner.remove_live(index) {
            return;
        }
        tracing::warn!(
            event = event::MESSAGE,
            child = index,
            live = self.connection_count(),
            "child connection lost, scheduling reconnect"
        );
        let mut reconnecting = self
            .inner
            .reconnecting
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !reconnecting.insert(index) {
            return;
        }
        drop(reconnecting);
        // Weak reference: the task dies with the cluster.
        tokio::spawn(run_reconnect(Arc::downgrade(&self.inner), index));
    }

    /// Submit to the next child in the rotation. `select_child` already
    /// refreshes the live set past dead children; a child that dies in the
    /// narrow window between selection and submission surfaces its error to
    /// the caller (the request never reached the wire, so resubmitting is
    /// safe) and is reaped from the live set here.
    pub async fn begin_execute<R, P>(
        &self,
        procedure: &str,
        params: &P,
        options: CallOptions<R>,
    ) -> Result<CallHandle<R>>
    where
        R: ResultShape,
        P: ParamPack,
    {
        let child = self.select_child()?;
        match child.begin_execute(procedure, params, options).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if e.is_terminal() || matches!(e, Error::InvalidState(_)) {
                    self.mark_dead_by_endpoint(child.endpoint());
                }
                Err(e)
            }
        }
    }

    fn mark_dead_by_endpoint(&self, endpoint: SocketAddr) {
        let index = {
            let pool = self.inner.pool.read().unwrap_or_else(|e| e.into_inner());
            pool.iter().position(|c| c.endpoint() == endpoint)
        };
        if let Some(index) = index {
            self.mark_dead(index);
        }
    }

    /// Synchronous facade over `begin_execute` + handle wait.
    pub async fn execute<R, P>(
        &self,
        procedure: &str,
        params: &P,
        timeout_ms: i64,
    ) -> Result<Response<R>>
    where
        R: ResultShape,
        P: ParamPack,
    {
        let handle = self
            .begin_execute(
                procedure,
                params,
                CallOptions {
                    timeout_ms,
                    ..CallOptions::default()
                },
            )
            .await?;
        handle.wait().await
    }

    /// Client-side abort; delegates to the child that owns the handle.
    pub async fn cancel<R: ResultShape>(&self, handle: &CallHandle<R>) -> bool {
        handle.cancel().await
    }

    /// Drain every child serially. Dispatch is suspended first, so the wall
    /// time is roughly the slowest child, not the sum. Per-child failures
    /// are swallowed so one bad child cannot block the others.
    pub async fn drain(&self) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            ConnectionStatus::Connected | ConnectionStatus::Closing
        ) {
            return Err(Error::invalid_state(format!(
                "cannot drain a {} cluster",
                status
            )));
        }
        let was_connected = self
            .inner
            .transition(ConnectionStatus::Connected, ConnectionStatus::Draining);
        tracing::info!(event = event::DRAINING_STARTED, "cluster draining");
        for child in self.inner.pool_snapshot() {
            if let Err(e) = child.drain().await {
                tracing::warn!(
                    event = event::MESSAGE,
                    endpoint = %child.endpoint(),
                    error = %e,
                    "child drain skipped"
                );
            }
        }
        if was_connected {
            self.inner
                .transition(ConnectionStatus::Draining, ConnectionStatus::Connected);
        }
        tracing::info!(event = event::DRAINING_COMPLETED, "cluster drained");
        Ok(())
    }

    /// Close every child, swallowing individual failures, then stop the
    /// shared callback executor.
    pub async fn close(&self, drain_first: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionStatus::Closed | ConnectionStatus::Closing => return Ok(()),
                _ => *state = ConnectionStatus::Closing,
            }
        }
        tracing::info!(event = event::CONNECTION_CLOSING, "cluster closing");
        if drain_first {
            for child in self.inner.pool_snapshot() {
                if let Err(e) = child.drain().await {
                    tracing::warn!(
                        event = event::MESSAGE,
                        endpoint = %child.endpoint(),
                        error = %e,
                        "child drain skipped"
                    );
                }
            }
        }
        for child in self.inner.pool_snapshot() {
            if let Err(e) = child.close(false).await {
                tracing::warn!(
                    event = event::MESSAGE,
                    endpoint = %child.endpoint(),
                    error = %e,
                    "child close failed"
                );
            }
        }
        *self.inner.live.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Vec::new());
        self.inner.executor.stop().await;
        self.inner.set_status(ConnectionStatus::Closed);
        tracing::info!(event = event::CONNECTION_CLOSED, "cluster closed");
        Ok(())
    }
}

/// Background reconnection of one dead child. Runs until the child is back
/// in the live set, the cluster leaves `Connected`, or the cluster is
/// dropped.
async fn run_reconnect(weak: Weak<ClusterInner>, index: usize) {
    loop {
        let done = try_reconnect(&weak, index).await;
        let Some(inner) = weak.upgrade() else { return };
        if done || inner.status() != ConnectionStatus::Connected {
            inner
                .reconnecting
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&index);
            return;
        }
        let backoff = inner.settings.connection_timeout();
        drop(inner);
        tokio::time::sleep(backoff).await;
    }
}

/// One reconnection attempt. Returns true when the child is live again.
async fn try_reconnect(weak: &Weak<ClusterInner>, index: usize) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    if inner.status() != ConnectionStatus::Connected {
        return false;
    }
    let Some(child) = inner.pool_entry(index) else {
        return true;
    };
    // The receive loop may have dropped the state to Closed already; if the
    // child still reports Connected the failure was transient and dispatch
    // can resume immediately.
    if !child.is_connected() {
        if child.status() != ConnectionStatus::Closed {
            return false;
        }
        if child.open().await.is_err() {
            return false;
        }
    }
    // Guard against the operator swapping the node for a different cluster.
    let Some(handshake) = child.handshake() else {
        return false;
    };
    if inner
        .check_identity(&handshake.identity, child.endpoint())
        .is_err()
    {
        tracing::warn!(
            event = event::MESSAGE,
            endpoint = %child.endpoint(),
            "reconnected child reports a different cluster, rejecting"
        );
        let _ = child.close(false).await;
        return false;
    }
    // The cluster may have begun closing while the child was opening; do
    // not hand a freshly-opened socket to a dead pool.
    if inner.status() != ConnectionStatus::Connected {
        let _ = child.close(false).await;
        return true;
    }
    inner.add_live(index);
    tracing::info!(
        event = event::MESSAGE,
        endpoint = %child.endpoint(),
        "child connection restored"
    );
    true
}
