//! Public facade: one `Client` in front of a node or cluster connection.
//!
//! `Client::create` picks the backend from the resolved host list: one
//! endpoint gets a single node connection, more get a cluster. Sub-facades
//! gate the privileged surfaces: ad-hoc SQL, system procedures and
//! statistics are each disabled unless the settings opt in.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::cache::UserState;
use crate::connection::{
    CallHandle, CallOptions, ClusterConnection, ConnectionStatus, NodeConnection, NodeInfo,
    Response, ResponseCallback,
};
use crate::stats::{summarize, StatisticsSnapshot};
use crate::types::{ConnectionSettings, Error, Result};
use crate::wire::protocol::ClusterIdentity;
use crate::wire::values::{ParamPack, ResultShape, Rowset};

/// Reserved procedure name for ad-hoc SQL.
pub const AD_HOC_PROCEDURE: &str = "@AdHoc";
/// Reserved system procedure names.
pub const SYS_PING: &str = "@Ping";
pub const SYS_SHUTDOWN: &str = "@Shutdown";
pub const SYS_STATISTICS: &str = "@Statistics";
pub const SYS_SYSTEM_INFORMATION: &str = "@SystemInformation";

#[derive(Debug, Clone)]
enum Backend {
    Node(NodeConnection),
    Cluster(ClusterConnection),
}

/// Aggregate identity and endpoint facts for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub is_cluster: bool,
    pub user_id: String,
    /// Children eligible for dispatch (1 or 0 for a single node).
    pub connection_count: usize,
    pub identity: Option<ClusterIdentity>,
    pub nodes: Vec<NodeInfo>,
}

/// Client for a PulseDB server or cluster.
#[derive(Debug, Clone)]
pub struct Client {
    settings: ConnectionSettings,
    backend: Backend,
}

impl Client {
    /// Build a closed client from settings: a node connection when the host
    /// list resolves to one endpoint, a cluster connection otherwise.
    pub fn create(settings: ConnectionSettings) -> Result<Self> {
        let endpoints = settings.resolve_endpoints()?;
        let backend = if endpoints.len() == 1 {
            Backend::Node(NodeConnection::new(settings.clone(), endpoints[0], None))
        } else {
            Backend::Cluster(ClusterConnection::new(settings.clone()))
        };
        Ok(Self { settings, backend })
    }

    /// Parse a connection string and build the client from it.
    pub fn from_connection_string(s: &str) -> Result<Self> {
        Self::create(ConnectionSettings::parse(s)?)
    }

    /// `create` followed by `open`.
    pub async fn connect(settings: ConnectionSettings) -> Result<Self> {
        let client = Self::create(settings)?;
        client.open().await?;
        Ok(client)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub async fn open(&self) -> Result<()> {
        match &self.backend {
            Backend::Node(node) => node.open().await,
            Backend::Cluster(cluster) => cluster.open().await,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match &self.backend {
            Backend::Node(node) => node.status(),
            Backend::Cluster(cluster) => cluster.status(),
        }
    }

    pub async fn drain(&self) -> Result<()> {
        match &self.backend {
            Backend::Node(node) => node.drain().await,
            Backend::Cluster(cluster) => cluster.drain().await,
        }
    }

    pub async fn close(&self, drain_first: bool) -> Result<()> {
        match &self.backend {
            Backend::Node(node) => node.close(drain_first).await,
            Backend::Cluster(cluster) => cluster.close(drain_first).await,
        }
    }

    /// Every pooled node connection (exactly one for a single-node client).
    pub fn nodes(&self) -> Vec<NodeConnection> {
        match &self.backend {
            Backend::Node(node) => vec![node.clone()],
            Backend::Cluster(cluster) => cluster.children(),
        }
    }

    /// Identity, endpoints and counts for diagnostics.
    pub fn info(&self) -> ConnectionInfo {
        let nodes: Vec<NodeInfo> = self.nodes().iter().filter_map(NodeConnection::info).collect();
        let (is_cluster, connection_count, identity) = match &self.backend {
            Backend::Node(node) => (
                false,
                usize::from(node.is_connected()),
                node.handshake().map(|h| h.identity),
            ),
            Backend::Cluster(cluster) => {
                (true, cluster.connection_count(), cluster.identity())
            }
        };
        ConnectionInfo {
            is_cluster,
            user_id: self.settings.user_id.clone(),
            connection_count,
            identity,
            nodes,
        }
    }

    /// Privilege gate applied to every dispatch.
    fn check_access(&self, procedure: &str) -> Result<()> {
        if procedure == AD_HOC_PROCEDURE {
            if !self.settings.allow_adhoc_queries {
                return Err(Error::permission_denied(
                    "ad-hoc queries are disabled; set allow_adhoc_queries",
                ));
            }
        } else if procedure.starts_with('@') && !self.settings.allow_system_calls {
            return Err(Error::permission_denied(format!(
                "system procedure {} is disabled; set allow_system_calls",
                procedure
            )));
        }
        Ok(())
    }

    /// Submit a call without waiting for the response.
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
        self.check_access(procedure)?;
        match &self.backend {
            Backend::Node(node) => node.begin_execute(procedure, params, options).await,
            Backend::Cluster(cluster) => cluster.begin_execute(procedure, params, options).await,
        }
    }

    /// Submit a call and wait for the decoded response.
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

    /// Client-side abort of an outstanding call.
    pub async fn cancel<R: ResultShape>(&self, handle: &CallHandle<R>) -> bool {
        handle.cancel().await
    }

    /// Strongly-typed handle for one named procedure.
    pub fn procedure<R, P>(&self, name: impl Into<String>) -> Procedure<R, P>
    where
        R: ResultShape,
        P: ParamPack,
    {
        Procedure {
            client: self.clone(),
            name: name.into(),
            timeout_ms: 0,
            _marker: PhantomData,
        }
    }

    /// Ad-hoc SQL facade; permitted only when `allow_adhoc_queries`.
    pub fn adhoc(&self) -> AdHocFacade {
        AdHocFacade {
            client: self.clone(),
        }
    }

    /// System procedure facade; permitted only when `allow_system_calls`.
    pub fn system(&self) -> SystemFacade {
        SystemFacade {
            client: self.clone(),
        }
    }

    /// Client-side statistics facade; permitted only when
    /// `statistics_enabled`.
    pub fn statistics(&self) -> StatisticsFacade {
        StatisticsFacade {
            client: self.clone(),
        }
    }
}

/// Typed procedure handle: result shape and parameter tuple fixed at the
/// type level, name and default timeout fixed at construction.
pub struct Procedure<R: ResultShape, P: ParamPack> {
    client: Client,
    name: String,
    timeout_ms: i64,
    _marker: PhantomData<fn(P) -> R>,
}

impl<R: ResultShape, P: ParamPack> std::fmt::Debug for Procedure<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl<R: ResultShape, P: ParamPack> Procedure<R, P> {
    /// Override the connection's default command timeout for this handle.
    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit and wait for the decoded response.
    pub async fn execute(&self, params: P) -> Result<Response<R>> {
        self.client
            .execute(&self.name, &params, self.timeout_ms)
            .await
    }

    /// Submit without waiting. `user_state` travels untouched to the
    /// callback and the response.
    pub async fn begin_execute(
        &self,
        params: P,
        user_state: Option<UserState>,
        callback: Option<ResponseCallback<R>>,
    ) -> Result<CallHandle<R>> {
        self.client
            .begin_execute(
                &self.name,
                &params,
                CallOptions {
                    timeout_ms: self.timeout_ms,
                    user_state,
                    callback,
                },
            )
            .await
    }

    /// Complete a previously-submitted call, raising its error if it did
    /// not succeed.
    pub async fn end_execute(&self, handle: CallHandle<R>) -> Result<Response<R>> {
        handle.wait().await
    }

    /// Like `execute`, but logs and swallows the failure.
    pub async fn try_execute(&self, params: P) -> Option<Response<R>> {
        match self.execute(params).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!(procedure = %self.name, error = %e, "try_execute failed");
                None
            }
        }
    }

    /// Client-side abort of an outstanding call on this procedure.
    pub async fn cancel(&self, handle: &CallHandle<R>) -> bool {
        handle.cancel().await
    }
}

/// Ad-hoc SQL: dispatches to the reserved ad-hoc procedure.
#[derive(Debug)]
pub struct AdHocFacade {
    client: Client,
}

impl AdHocFacade {
    /// Run one ad-hoc SQL statement. Parameter placeholders are not
    /// supported on this path and are rejected before I/O.
    pub async fn execute<R: ResultShape>(&self, query: &str) -> Result<Response<R>> {
        if query.contains('?') {
            return Err(Error::bad_argument(
                "ad-hoc queries do not support parameter placeholders",
            ));
        }
        self.client
            .execute(AD_HOC_PROCEDURE, &(query,), 0)
            .await
    }
}

/// Thin wrappers over the privileged system procedures.
#[derive(Debug)]
pub struct SystemFacade {
    client: Client,
}

impl SystemFacade {
    pub async fn ping(&self) -> Result<Response<()>> {
        self.client.execute(SYS_PING, &(), 0).await
    }

    pub async fn shutdown(&self) -> Result<Response<()>> {
        self.client.execute(SYS_SHUTDOWN, &(), 0).await
    }

    pub async fn system_information(&self) -> Result<Response<Rowset>> {
        self.client.execute(SYS_SYSTEM_INFORMATION, &(), 0).await
    }

    /// Server-side statistics for one component.
    pub async fn statistics(&self, component: &str) -> Result<Response<Rowset>> {
        self.client.execute(SYS_STATISTICS, &(component,), 0).await
    }
}

/// Client-side statistics: snapshots, aggregation and reset.
#[derive(Debug)]
pub struct StatisticsFacade {
    client: Client,
}

impl StatisticsFacade {
    fn check_enabled(&self) -> Result<()> {
        if !self.client.settings.statistics_enabled {
            return Err(Error::permission_denied(
                "statistics are disabled; set statistics_enabled",
            ));
        }
        Ok(())
    }

    /// Per-procedure snapshots, one map per node endpoint.
    pub fn by_node(&self) -> Result<HashMap<SocketAddr, HashMap<String, StatisticsSnapshot>>> {
        self.check_enabled()?;
        Ok(self
            .client
            .nodes()
            .iter()
            .map(|node| (node.endpoint(), node.snapshot_procedures()))
            .collect())
    }

    /// Per-procedure snapshots aggregated across every node.
    pub fn procedures(&self) -> Result<HashMap<String, StatisticsSnapshot>> {
        self.check_enabled()?;
        let mut grouped: HashMap<String, Vec<StatisticsSnapshot>> = HashMap::new();
        for node in self.client.nodes() {
            for (name, snapshot) in node.snapshot_procedures() {
                grouped.entry(name).or_default().push(snapshot);
            }
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(name, snaps)| summarize(snaps).map(|s| (name, s)))
            .collect())
    }

    /// One aggregate over every procedure on every node.
    pub fn summary(&self) -> Result<Option<StatisticsSnapshot>> {
        Ok(summarize(self.procedures()?.into_values()))
    }

    /// Lifetime counters (never cleared by reset), aggregated across nodes.
    pub fn lifetime(&self) -> Result<Option<StatisticsSnapshot>> {
        self.check_enabled()?;
        Ok(summarize(
            self.client
                .nodes()
                .iter()
                .map(NodeConnection::snapshot_lifetime),
        ))
    }

    /// Reset the per-procedure counters on every node. With
    /// `ignore_pending`, responses for calls submitted before the reset are
    /// dropped from the fresh counters when they arrive.
    pub fn reset(&self, ignore_pending: bool) -> Result<()> {
        self.check_enabled()?;
        for node in self.client.nodes() {
            node.reset_statistics(ignore_pending);
        }
        Ok(())
    }
}
