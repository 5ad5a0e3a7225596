//! Driver error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. The taxonomy is stable: callers can match
//! on variants to distinguish user mistakes from connection-level failures.

use thiserror::Error;

/// Driver result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the PulseDB client driver.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid user input detected before any I/O (bad timeout, invalid
    /// procedure name, ad-hoc query with placeholder, oversize parameter).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Feature disabled by the connection settings (system calls, ad-hoc
    /// queries, statistics).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation not legal in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The underlying byte stream failed.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// The connection was explicitly closed locally.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The socket died while operating; pending work was aborted.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Login handshake was rejected by the server.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A child node disagrees with the already-learned cluster identity.
    #[error("inconsistent cluster: {0}")]
    InconsistentCluster(String),

    /// Cluster open failed under the configured policy. Carries the
    /// per-host summary.
    #[error("cluster connection failure: {0}")]
    ClusterConnectionFailure(String),

    /// The cluster ran out of live children during dispatch.
    #[error("no live connections: {0}")]
    NoLiveConnections(String),

    /// Client-side timeout elapsed. The server may still complete the
    /// execution; nothing is retried.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the handle before a response arrived.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The server returned a failure status (carries the server message).
    #[error("server error: {0}")]
    ServerError(String),

    /// I/O errors surfaced at the API boundary (connect, handshake).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn transport_lost(msg: impl Into<String>) -> Self {
        Self::TransportLost(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    pub fn inconsistent_cluster(msg: impl Into<String>) -> Self {
        Self::InconsistentCluster(msg.into())
    }

    pub fn cluster_connection_failure(msg: impl Into<String>) -> Self {
        Self::ClusterConnectionFailure(msg.into())
    }

    pub fn no_live_connections(msg: impl Into<String>) -> Self {
        Self::NoLiveConnections(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    pub fn server_error(msg: impl Into<String>) -> Self {
        Self::ServerError(msg.into())
    }
}

impl Error {
    /// True for kinds that terminate the owning connection (any subsequent
    /// operation that would touch the socket re-raises the retained error).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::TransportLost(_) | Error::ConnectionLost(_) | Error::ConnectionClosed(_)
        )
    }

    /// Clone the error for fan-out to multiple pending handles.
    ///
    /// `std::io::Error` is not `Clone`, so `Io` collapses to `TransportLost`
    /// with the rendered message.
    pub fn duplicate(&self) -> Self {
        match self {
            Error::BadArgument(m) => Error::BadArgument(m.clone()),
            Error::PermissionDenied(m) => Error::PermissionDenied(m.clone()),
            Error::InvalidState(m) => Error::InvalidState(m.clone()),
            Error::TransportLost(m) => Error::TransportLost(m.clone()),
            Error::ConnectionClosed(m) => Error::ConnectionClosed(m.clone()),
            Error::ConnectionLost(m) => Error::ConnectionLost(m.clone()),
            Error::AuthFailed(m) => Error::AuthFailed(m.clone()),
            Error::InconsistentCluster(m) => Error::InconsistentCluster(m.clone()),
            Error::ClusterConnectionFailure(m) => Error::ClusterConnectionFailure(m.clone()),
            Error::NoLiveConnections(m) => Error::NoLiveConnections(m.clone()),
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Aborted(m) => Error::Aborted(m.clone()),
            Error::ServerError(m) => Error::ServerError(m.clone()),
            Error::Io(e) => Error::TransportLost(e.to_string()),
        }
    }
}
