//! Node connection: one socket, one receive worker, one timeout sweeper.
//!
//! The submit path serializes writes through an async writer lock; the
//! receive loop exclusively owns the read half. A fatal I/O error on either
//! side retains the first error as terminal, aborts every pending request
//! and drops the state back to `Closed`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CallOutcome, CallStatus, CallbackFn, ExecutionCache, PendingRequest};
use crate::callbacks::CallbackExecutor;
use crate::connection::{CallHandle, CallOptions, ConnectionStatus, Response};
use crate::observability::event;
use crate::stats::{StatisticsRegistry, StatisticsSnapshot};
use crate::types::{ConnectionSettings, Error, Result, TIMEOUT_INFINITE};
use crate::wire::codec::{read_frame, write_frame};
use crate::wire::protocol::{
    decode_login_response, decode_response, encode_invocation, encode_login_request,
    HandshakeInfo, ResponseStatus,
};
use crate::wire::values::{ParamPack, ResultShape};

/// Coarse tick of the timeout sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);
/// Sleep slice of the backpressure and drain spins.
const SPIN_INTERVAL: Duration = Duration::from_millis(1);

/// Identity and endpoint facts for one node connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    pub endpoint: SocketAddr,
    pub user_id: String,
    pub host_id: i32,
    pub connection_id: i64,
    pub build_string: String,
    pub cluster_start_timestamp: i64,
    pub leader_endpoint: String,
}

pub(crate) struct NodeInner {
    settings: ConnectionSettings,
    endpoint: SocketAddr,
    state: Mutex<ConnectionStatus>,
    cache: ExecutionCache,
    stats: StatisticsRegistry,
    executor: Arc<CallbackExecutor>,
    owns_executor: bool,
    sequence: AtomicU64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    terminal: Mutex<Option<Error>>,
    handshake: Mutex<Option<HandshakeInfo>>,
    cancel: Mutex<Option<CancellationToken>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInner")
            .field("endpoint", &self.endpoint)
            .field("state", &self.status())
            .field("pending", &self.cache.size())
            .finish()
    }
}

impl NodeInner {
    fn status(&self) -> ConnectionStatus {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Swap the state only when it currently matches `from`.
    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn terminal_error(&self) -> Option<Error> {
        self.terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Error::duplicate)
    }

    /// Retain the first terminal error; later ones are dropped.
    fn set_terminal(&self, error: Error) {
        let mut slot = self.terminal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Deliver an outcome: completion signal first, then the callback via
    /// the executor. The cache slot is released only after the callback has
    /// run, which is what lets `drain` wait for callbacks.
    async fn deliver(self: &Arc<Self>, request: PendingRequest, outcome: CallOutcome) {
        let PendingRequest {
            completion,
            callback,
            ..
        } = request;
        let _ = completion.send(outcome.clone());
        match callback {
            Some(cb) => {
                let inner = Arc::clone(self);
                self.executor
                    .submit(move || {
                        cb(outcome);
                        inner.cache.end_remove();
                    })
                    .await;
            }
            None => self.cache.end_remove(),
        }
    }

    /// Terminal failure path: retain the error, stop the workers, abort
    /// every pending request with `connection_lost`, return to `Closed`.
    async fn fail(self: &Arc<Self>, error: Error) {
        tracing::error!(
            event = event::MESSAGE,
            endpoint = %self.endpoint,
            error = %error,
            "connection failed"
        );
        self.set_terminal(error);
        self.set_status(ConnectionStatus::Closed);
        if let Some(cancel) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
        *self.writer.lock().await = None;

        for request in self.cache.drain_all() {
            let outcome = request.failed_outcome(
                CallStatus::Aborted,
                Error::connection_lost(format!("connection to {} lost", self.endpoint)),
            );
            self.stats.close_request(
                &request.procedure,
                request.execution_id,
                0,
                CallStatus::Aborted,
                0,
            );
            if self.settings.trace_enabled {
                tracing::warn!(
                    event = event::EXECUTION_ABORTED,
                    endpoint = %self.endpoint,
                    execution_id = request.execution_id,
                    procedure = %request.procedure,
                    "aborted by connection loss"
                );
            }
            self.deliver(request, outcome).await;
        }
    }
}

/// Connection to a single server node.
#[derive(Debug, Clone)]
pub struct NodeConnection {
    inner: Arc<NodeInner>,
}

impl NodeConnection {
    /// Create a closed connection. `executor` shares a cluster's callback
    /// pool; standalone connections own one and stop it on close.
    pub(crate) fn new(
        settings: ConnectionSettings,
        endpoint: SocketAddr,
        executor: Option<Arc<CallbackExecutor>>,
    ) -> Self {
        let statistics_enabled = settings.statistics_enabled;
        let (executor, owns_executor) = match executor {
            Some(shared) => (shared, false),
            None => (Arc::new(CallbackExecutor::new()), true),
        };
        Self {
            inner: Arc::new(NodeInner {
                settings,
                endpoint,
                state: Mutex::new(ConnectionStatus::Closed),
                cache: ExecutionCache::new(),
                stats: StatisticsRegistry::new(statistics_enabled),
                executor,
                owns_executor,
                sequence: AtomicU64::new(0),
                writer: tokio::sync::Mutex::new(None),
                terminal: Mutex::new(None),
                handshake: Mutex::new(None),
                cancel: Mutex::new(None),
                workers: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::Draining
        )
    }

    /// Number of requests currently counted in the execution cache.
    pub fn pending_count(&self) -> u64 {
        self.inner.cache.size()
    }

    /// Identity facts recorded from the login handshake.
    pub fn info(&self) -> Option<NodeInfo> {
        let handshake = self
            .inner
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        handshake.as_ref().map(|h| NodeInfo {
            endpoint: self.inner.endpoint,
            user_id: self.inner.settings.user_id.clone(),
            host_id: h.host_id,
            connection_id: h.connection_id,
            build_string: h.identity.build_string.clone(),
            cluster_start_timestamp: h.identity.cluster_start_timestamp,
            leader_endpoint: h.identity.leader_endpoint.clone(),
        })
    }

    pub(crate) fn handshake(&self) -> Option<HandshakeInfo> {
        self.inner
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open the byte stream and perform the login handshake, then start the
    /// receive and timeout workers.
    pub async fn open(&self) -> Result<()> {
        if !self.inner.transition(ConnectionStatus::Closed, ConnectionStatus::Connecting) {
            return Err(Error::invalid_state(format!(
                "cannot open connection to {}: state is {}",
                self.inner.endpoint,
                self.status()
            )));
        }
        *self
            .inner
            .terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        match self.open_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.set_status(ConnectionStatus::Closed);
                *self.inner.writer.lock().await = None;
                Err(e)
            }
        }
    }

    async fn open_inner(&self) -> Result<()> {
        let timeout = self.inner.settings.connection_timeout();
        let endpoint = self.inner.endpoint;

        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::timeout(format!("connect to {} timed out", endpoint)))??;
        stream.set_nodelay(true)?;
        let (mut read_half, mut write_half) = stream.into_split();

        // Login handshake under the same deadline as the connect.
        let login = encode_login_request(
            &self.inner.settings.user_id,
            &self.inner.settings.password,
        );
        let handshake = tokio::time::timeout(timeout, async {
            write_frame(&mut write_half, &login).await?;
            let frame = read_frame(&mut read_half)
                .await?
                .ok_or_else(|| Error::transport_lost("stream closed during handshake"))?;
            decode_login_response(frame)
        })
        .await
        .map_err(|_| Error::timeout(format!("handshake with {} timed out", endpoint)))??;

        *self
            .inner
            .handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handshake);
        *self.inner.writer.lock().await = Some(write_half);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());

        let receive = tokio::spawn(run_receive_loop(
            Arc::clone(&self.inner),
            read_half,
            cancel.clone(),
        ));
        let sweeper = tokio::spawn(run_timeout_sweeper(Arc::clone(&self.inner), cancel));
        {
            let mut workers = self.inner.workers.lock().await;
            workers.push(receive);
            workers.push(sweeper);
        }

        self.inner.set_status(ConnectionStatus::Connected);
        tracing::info!(
            event = event::CONNECTION_OPENED,
            endpoint = %endpoint,
            user_id = %self.inner.settings.user_id,
            "connection opened"
        );
        Ok(())
    }

    fn resolve_timeout(&self, timeout_ms: i64) -> Result<Option<Duration>> {
        match timeout_ms {
            0 => Ok(self.inner.settings.command_timeout()),
            TIMEOUT_INFINITE => Ok(None),
            t if t > 0 => Ok(Some(Duration::from_millis(t as u64))),
            t => Err(Error::bad_argument(format!("invalid timeout: {} ms", t))),
        }
    }

    /// Submit a procedure invocation without waiting for the response.
    ///
    /// Suspends only for the backpressure spin when the execution cache is
    /// at capacity. Parameter validation happens before any I/O.
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
        if let Some(terminal) = self.inner.terminal_error() {
            return Err(terminal);
        }
        if self.status() != ConnectionStatus::Connected {
            return Err(Error::invalid_state(format!(
                "cannot execute on {} connection",
                self.status()
            )));
        }

        let timeout = self.resolve_timeout(options.timeout_ms)?;
        let execution_id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        // Encode before anything else: oversize and invalid values fail
        // before any slot or byte is spent.
        let message = encode_invocation(execution_id, procedure, params)?;

        // The deadline clock starts at submission, so time spent in the
        // backpressure spin below counts against the caller's timeout.
        let now = Instant::now();
        let (completion, rx) = tokio::sync::oneshot::channel();
        let callback: Option<CallbackFn> = options.callback.map(|cb| {
            Box::new(move |outcome: CallOutcome| cb(Response::<R>::from_outcome(outcome)))
                as CallbackFn
        });
        let request = PendingRequest {
            execution_id,
            procedure: procedure.to_string(),
            submitted_at: now,
            expires_at: timeout.map(|t| now + t),
            completion,
            callback,
            user_state: options.user_state,
        };

        // Backpressure: momentary overshoot past the threshold is tolerated
        // because the counter moves before the map.
        while self.inner.cache.size() >= self.inner.settings.max_outstanding_txns as u64 {
            if let Some(terminal) = self.inner.terminal_error() {
                return Err(terminal);
            }
            if self.status() != ConnectionStatus::Connected {
                return Err(Error::invalid_state(format!(
                    "connection became {} while waiting for capacity",
                    self.status()
                )));
            }
            tokio::time::sleep(SPIN_INTERVAL).await;
        }

        self.inner.cache.insert(request);

        let bytes_sent = message.len() as u64 + 4;
        let write_error = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(w) => write_frame(w, &message).await.err(),
                None => Some(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket already torn down",
                )),
            }
        };
        if let Some(e) = write_error {
            // A write failure has no guaranteed read-side counterpart on the
            // same socket, so run the terminal failure path directly: abort
            // every pending request (this one included), stop the workers
            // and drop the state to Closed. The writer lock is released
            // above; `fail` re-takes it.
            self.inner
                .fail(Error::connection_lost(format!("write failed: {}", e)))
                .await;
        }

        // If the connection died around the insert, the failure path may
        // have missed this entry; reap it ourselves.
        if self.inner.terminal_error().is_some() {
            if let Some(request) = self.inner.cache.begin_remove(execution_id) {
                let outcome = request.failed_outcome(
                    CallStatus::Aborted,
                    Error::connection_lost(format!("connection to {} lost", self.inner.endpoint)),
                );
                self.inner.deliver(request, outcome).await;
            }
            return Ok(CallHandle::new(execution_id, self.clone(), rx));
        }

        self.inner.stats.open_request(procedure, bytes_sent);
        if self.inner.settings.trace_enabled {
            tracing::info!(
                event = event::EXECUTION_STARTED,
                endpoint = %self.inner.endpoint,
                execution_id,
                procedure,
                "execution started"
            );
        }
        Ok(CallHandle::new(execution_id, self.clone(), rx))
    }

    /// Synchronous facade: submit and wait for the decoded response.
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

    /// Client-side abort. Returns `true` when this call won the race against
    /// the response and the sweeper; the callback is then delivered exactly
    /// once with status `Aborted`. The server-side execution continues
    /// regardless.
    pub async fn cancel<R: ResultShape>(&self, handle: &CallHandle<R>) -> bool {
        handle.cancel().await
    }

    pub(crate) async fn cancel_by_id(&self, execution_id: u64) -> bool {
        let Some(request) = self.inner.cache.begin_remove(execution_id) else {
            return false;
        };
        let outcome = request.failed_outcome(
            CallStatus::Aborted,
            Error::aborted(format!(
                "execution {} cancelled by caller",
                request.execution_id
            )),
        );
        self.inner.stats.close_request(
            &request.procedure,
            request.execution_id,
            0,
            CallStatus::Aborted,
            0,
        );
        if self.inner.settings.trace_enabled {
            tracing::info!(
                event = event::EXECUTION_ABORTED,
                endpoint = %self.inner.endpoint,
                execution_id = request.execution_id,
                procedure = %request.procedure,
                "execution cancelled"
            );
        }
        self.inner.deliver(request, outcome).await;
        true
    }

    /// Wait until every submitted request has completed, callbacks included.
    pub async fn drain(&self) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            ConnectionStatus::Connected | ConnectionStatus::Closing
        ) {
            return Err(Error::invalid_state(format!(
                "cannot drain a {} connection",
                status
            )));
        }
        let was_connected = self
            .inner
            .transition(ConnectionStatus::Connected, ConnectionStatus::Draining);
        tracing::info!(
            event = event::DRAINING_STARTED,
            endpoint = %self.inner.endpoint,
            pending = self.inner.cache.size(),
            "draining"
        );
        while self.inner.cache.size() > 0 {
            tokio::time::sleep(SPIN_INTERVAL).await;
        }
        if was_connected {
            // Only restore Connected if a failure has not moved us since.
            self.inner
                .transition(ConnectionStatus::Draining, ConnectionStatus::Connected);
        }
        tracing::info!(
            event = event::DRAINING_COMPLETED,
            endpoint = %self.inner.endpoint,
            "drained"
        );
        Ok(())
    }

    /// Close the connection, optionally draining first. Residual pending
    /// requests are aborted with `connection_closed`.
    pub async fn close(&self, drain_first: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                ConnectionStatus::Closed => return Ok(()),
                ConnectionStatus::Closing => return Ok(()),
                _ => *state = ConnectionStatus::Closing,
            }
        }
        tracing::info!(
            event = event::CONNECTION_CLOSING,
            endpoint = %self.inner.endpoint,
            "closing"
        );

        if drain_first {
            while self.inner.cache.size() > 0 && self.inner.terminal_error().is_none() {
                tokio::time::sleep(SPIN_INTERVAL).await;
            }
        }

        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
        *self.inner.writer.lock().await = None;

        for request in self.inner.cache.drain_all() {
            let outcome = request.failed_outcome(
                CallStatus::Aborted,
                Error::connection_closed("connection closed while call was pending"),
            );
            self.inner.stats.close_request(
                &request.procedure,
                request.execution_id,
                0,
                CallStatus::Aborted,
                0,
            );
            self.inner.deliver(request, outcome).await;
        }

        self.inner.stats.seal();
        self.inner
            .set_terminal(Error::connection_closed("connection explicitly closed"));
        if self.inner.owns_executor {
            self.inner.executor.stop().await;
        }
        self.inner.set_status(ConnectionStatus::Closed);
        tracing::info!(
            event = event::CONNECTION_CLOSED,
            endpoint = %self.inner.endpoint,
            "closed"
        );
        Ok(())
    }

    // Statistics surface, consumed by the facade.

    pub(crate) fn snapshot_procedures(
        &self,
    ) -> std::collections::HashMap<String, StatisticsSnapshot> {
        self.inner.stats.snapshot_procedures()
    }

    pub(crate) fn snapshot_lifetime(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot_lifetime()
    }

    pub(crate) fn reset_statistics(&self, ignore_pending: bool) {
        let watermark = self.inner.sequence.load(Ordering::SeqCst) + 1;
        self.inner.stats.reset(ignore_pending, watermark);
    }
}

/// Receive worker: correlate response frames with pending requests.
async fn run_receive_loop(
    inner: Arc<NodeInner>,
    mut reader: OwnedReadHalf,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut reader) => {
                let payload = match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        inner
                            .fail(Error::connection_lost("server closed the stream"))
                            .await;
                        return;
                    }
                    Err(e) => {
                        inner
                            .fail(Error::connection_lost(format!("read failed: {}", e)))
                            .await;
                        return;
                    }
                };
                let frame_bytes = payload.len() as u64 + 4;
                let response = match decode_response(payload) {
                    Ok(response) => response,
                    Err(e) => {
                        inner.fail(e).await;
                        return;
                    }
                };

                let Some(request) = inner.cache.begin_remove(response.execution_id) else {
                    // Late arrival after a timeout or abort: drop the frame,
                    // keep the bytes on the lifetime tally.
                    inner.stats.note_discarded_bytes(frame_bytes);
                    tracing::debug!(
                        event = event::MESSAGE,
                        endpoint = %inner.endpoint,
                        execution_id = response.execution_id,
                        "discarded late response"
                    );
                    continue;
                };

                let (status, result) = match response.status {
                    ResponseStatus::Success => (CallStatus::Succeeded, Ok(response.payload)),
                    ResponseStatus::UserAbort => (
                        CallStatus::Aborted,
                        Err(Error::aborted(
                            response
                                .server_message
                                .unwrap_or_else(|| "aborted by server".to_string()),
                        )),
                    ),
                    ResponseStatus::GracefulFailure | ResponseStatus::UnexpectedFailure => (
                        CallStatus::Failed,
                        Err(Error::server_error(
                            response
                                .server_message
                                .unwrap_or_else(|| "unspecified server failure".to_string()),
                        )),
                    ),
                };
                let outcome = CallOutcome {
                    execution_id: request.execution_id,
                    procedure: request.procedure.clone(),
                    status,
                    duration_ms: response.duration_ms,
                    result,
                    user_state: request.user_state.clone(),
                };
                inner.stats.close_request(
                    &request.procedure,
                    request.execution_id,
                    i64::from(response.duration_ms),
                    status,
                    frame_bytes,
                );
                if inner.settings.trace_enabled {
                    match status {
                        CallStatus::Succeeded => tracing::info!(
                            event = event::EXECUTION_COMPLETED,
                            endpoint = %inner.endpoint,
                            execution_id = request.execution_id,
                            procedure = %request.procedure,
                            duration_ms = response.duration_ms,
                            "execution completed"
                        ),
                        _ => tracing::warn!(
                            event = event::EXECUTION_FAILED,
                            endpoint = %inner.endpoint,
                            execution_id = request.execution_id,
                            procedure = %request.procedure,
                            "execution failed"
                        ),
                    }
                }
                inner.deliver(request, outcome).await;
            }
        }
    }
}

/// Timeout worker: complete expired requests with status `TimedOut`.
async fn run_timeout_sweeper(inner: Arc<NodeInner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }
        let now = Instant::now();
        for execution_id in inner.cache.expired_ids(now) {
            // The atomic removal resolves the race against a late real
            // response: exactly one side wins.
            let Some(request) = inner.cache.begin_remove(execution_id) else {
                continue;
            };
            let outcome = request.failed_outcome(
                CallStatus::TimedOut,
                Error::timeout(format!(
                    "execution {} exceeded its deadline",
                    request.execution_id
                )),
            );
            inner.stats.close_request(
                &request.procedure,
                request.execution_id,
                i64::from(outcome.duration_ms),
                CallStatus::TimedOut,
                0,
            );
            if inner.settings.trace_enabled {
                tracing::warn!(
                    event = event::EXECUTION_TIMEDOUT,
                    endpoint = %inner.endpoint,
                    execution_id = request.execution_id,
                    procedure = %request.procedure,
                    "execution timed out"
                );
            }
            inner.deliver(request, outcome).await;
        }
    }
}
