#![allow(dead_code)]

//! Shared test fixture: an in-process mock server speaking the wire
//! protocol, with scripted delays, held responses, login rejection and a
//! kill switch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use pulse_client::wire::codec::{read_frame, write_frame};
use pulse_client::wire::protocol::{
    decode_invocation, encode_login_rejection, encode_login_response, encode_response,
    HandshakeInfo, ResponseStatus,
};
use pulse_client::wire::values::{encode_rows, ScalarValue};
use pulse_client::ClusterIdentity;

pub fn identity(build: &str) -> ClusterIdentity {
    ClusterIdentity {
        build_string: build.to_string(),
        cluster_start_timestamp: 1_700_000_000,
        leader_endpoint: "10.0.0.1:21212".to_string(),
    }
}

/// Scripted behavior for one mock server.
#[derive(Clone)]
pub struct MockBehavior {
    pub identity: ClusterIdentity,
    pub host_id: i32,
    pub reject_login: bool,
    /// Sleep before every response.
    pub response_delay: Duration,
    /// When set, a permit must be acquired before responding; tests release
    /// permits with `add_permits` to unblock responses one by one.
    pub gate: Option<Arc<Semaphore>>,
}

impl MockBehavior {
    pub fn ok() -> Self {
        Self {
            identity: identity("pulsedb-2.4.1"),
            host_id: 0,
            reject_login: false,
            response_delay: Duration::ZERO,
            gate: None,
        }
    }

    pub fn with_identity(mut self, identity: ClusterIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }
}

/// One running mock server instance.
pub struct MockServer {
    pub addr: SocketAddr,
    /// Total invocation frames received across all connections.
    pub invocations: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl MockServer {
    pub async fn start(behavior: MockBehavior) -> Self {
        Self::start_at("127.0.0.1:0".parse().unwrap(), behavior).await
    }

    /// Bind a specific address (used to restart a killed server on the same
    /// endpoint).
    pub async fn start_at(addr: SocketAddr, behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let invocations = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let connection_seq = Arc::new(AtomicI64::new(0));

        let accept_cancel = cancel.clone();
        let accept_invocations = Arc::clone(&invocations);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { break };
                        let behavior = behavior.clone();
                        let invocations = Arc::clone(&accept_invocations);
                        let cancel = accept_cancel.clone();
                        let connection_id = connection_seq.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            let _ = serve_connection(
                                stream,
                                behavior,
                                invocations,
                                cancel,
                                connection_id,
                            )
                            .await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            invocations,
            cancel,
        }
    }

    /// Stop accepting and drop every open connection mid-stream.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: TcpStream,
    behavior: MockBehavior,
    invocations: Arc<AtomicU64>,
    cancel: CancellationToken,
    connection_id: i64,
) -> std::io::Result<()> {
    let (mut reader, writer) = stream.into_split();

    // Login handshake.
    let Some(_login) = read_frame(&mut reader).await? else {
        return Ok(());
    };
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    if behavior.reject_login {
        write_frame(&mut *writer.lock().await, &encode_login_rejection()).await?;
        return Ok(());
    }
    let handshake = HandshakeInfo {
        host_id: behavior.host_id,
        connection_id,
        identity: behavior.identity.clone(),
    };
    write_frame(&mut *writer.lock().await, &encode_login_response(&handshake)).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut reader) => {
                let Some(payload) = frame? else { return Ok(()) };
                let Ok(request) = decode_invocation(payload) else { return Ok(()) };
                invocations.fetch_add(1, Ordering::SeqCst);

                let behavior = behavior.clone();
                let writer = Arc::clone(&writer);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Some(gate) = &behavior.gate {
                        let Ok(permit) = Arc::clone(gate).acquire_owned().await else {
                            return;
                        };
                        // Consume the permit: each release unblocks one
                        // response.
                        permit.forget();
                    }
                    if !behavior.response_delay.is_zero() {
                        tokio::time::sleep(behavior.response_delay).await;
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    let rows = encode_rows(&[vec![
                        ScalarValue::Str(request.procedure.clone()),
                        ScalarValue::I64(request.execution_id as i64),
                    ]])
                    .unwrap();
                    let response = encode_response(
                        request.execution_id,
                        ResponseStatus::Success,
                        1,
                        None,
                        &rows,
                    );
                    let _ = write_frame(&mut *writer.lock().await, &response).await;
                });
            }
        }
    }
}

/// Poll `predicate` until it holds or `deadline` elapses.
pub async fn wait_until<F: FnMut() -> bool>(mut predicate: F, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
