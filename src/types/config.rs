//! Connection settings.
//!
//! Settings are immutable after construction and are consumed either as a
//! plain struct or parsed from a `key=value;key=value` connection string.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Default server port.
pub const DEFAULT_PORT: u16 = 21212;
/// Default connect/handshake timeout in milliseconds.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: i64 = 5_000;
/// Default per-command timeout in milliseconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: i64 = 5_000;
/// Default backpressure threshold per node connection.
pub const DEFAULT_MAX_OUTSTANDING_TXNS: usize = 3_000;
/// Default number of consecutive dispatches to one node before advancing.
pub const DEFAULT_LOAD_BALANCING_BATCH_SIZE: u64 = 100;

/// Sentinel for an infinite timeout.
pub const TIMEOUT_INFINITE: i64 = -1;

/// Connection settings, immutable once a connection uses them.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Comma or space separated host list; each entry may carry a `:port`.
    pub host_list: String,
    /// Default port for entries without an explicit one.
    pub port: u16,
    /// Socket connect + login handshake timeout, milliseconds.
    pub connection_timeout_ms: i64,
    /// Default per-command timeout, milliseconds. `-1` means infinite.
    pub default_command_timeout_ms: i64,
    /// Login user. Empty string logs in anonymously.
    pub user_id: String,
    /// Login password (hashed before it crosses the wire).
    pub password: String,
    /// When false, the password is omitted from rendered connection strings
    /// and from Debug output.
    pub persist_security_info: bool,
    /// Permit `@`-prefixed system procedures.
    pub allow_system_calls: bool,
    /// Permit ad-hoc SQL through the reserved ad-hoc procedure.
    pub allow_adhoc_queries: bool,
    /// Permit more than one pool entry resolving to the same endpoint.
    pub allow_multiple_host_connections: bool,
    /// Cluster open policy: fail unless every host connects.
    pub connect_to_all_or_none: bool,
    /// Backpressure threshold per node connection.
    pub max_outstanding_txns: usize,
    /// Consecutive dispatches to the same node before round-robin advances.
    pub load_balancing_batch_size: u64,
    /// Emit per-request trace events.
    pub trace_enabled: bool,
    /// Maintain per-procedure statistics.
    pub statistics_enabled: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host_list: "localhost".to_string(),
            port: DEFAULT_PORT,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            default_command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            user_id: String::new(),
            password: String::new(),
            persist_security_info: false,
            allow_system_calls: false,
            allow_adhoc_queries: false,
            allow_multiple_host_connections: false,
            connect_to_all_or_none: false,
            max_outstanding_txns: DEFAULT_MAX_OUTSTANDING_TXNS,
            load_balancing_batch_size: DEFAULT_LOAD_BALANCING_BATCH_SIZE,
            trace_enabled: false,
            statistics_enabled: false,
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password: &str = if self.persist_security_info {
            &self.password
        } else {
            "<redacted>"
        };
        f.debug_struct("ConnectionSettings")
            .field("host_list", &self.host_list)
            .field("port", &self.port)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("default_command_timeout_ms", &self.default_command_timeout_ms)
            .field("user_id", &self.user_id)
            .field("password", &password)
            .field("persist_security_info", &self.persist_security_info)
            .field("allow_system_calls", &self.allow_system_calls)
            .field("allow_adhoc_queries", &self.allow_adhoc_queries)
            .field(
                "allow_multiple_host_connections",
                &self.allow_multiple_host_connections,
            )
            .field("connect_to_all_or_none", &self.connect_to_all_or_none)
            .field("max_outstanding_txns", &self.max_outstanding_txns)
            .field("load_balancing_batch_size", &self.load_balancing_batch_size)
            .field("trace_enabled", &self.trace_enabled)
            .field("statistics_enabled", &self.statistics_enabled)
            .finish()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        other => Err(Error::bad_argument(format!(
            "invalid boolean for {}: {}",
            key, other
        ))),
    }
}

fn parse_int(key: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| Error::bad_argument(format!("invalid integer for {}: {}", key, value)))
}

/// Negative timeout values mean "infinite" for command timeouts.
fn normalize_command_timeout(ms: i64) -> i64 {
    if ms < 0 {
        TIMEOUT_INFINITE
    } else {
        ms
    }
}

/// Connect timeouts cannot be infinite; negatives fall back to the default.
fn normalize_connection_timeout(ms: i64) -> i64 {
    if ms < 0 {
        DEFAULT_CONNECTION_TIMEOUT_MS
    } else {
        ms
    }
}

impl ConnectionSettings {
    /// Parse a `key=value;key=value` connection string.
    ///
    /// Keys are case-insensitive. Recognized synonyms: `servers`, `hosts`
    /// and `cluster` for the host list, `uid` for the user, `pwd` for the
    /// password. Unknown keys are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let mut settings = Self::default();
        for fragment in s.split(';') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            let (key, value) = fragment.split_once('=').ok_or_else(|| {
                Error::bad_argument(format!("malformed connection string fragment: {}", fragment))
            })?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "host_list" | "servers" | "hosts" | "cluster" => {
                    settings.host_list = value.to_string();
                }
                "port" => {
                    let port = parse_int(&key, value)?;
                    // Out-of-range ports reset to the default rather than erroring.
                    settings.port = if (1..=65_535).contains(&port) {
                        port as u16
                    } else {
                        DEFAULT_PORT
                    };
                }
                "connection_timeout_ms" => {
                    settings.connection_timeout_ms =
                        normalize_connection_timeout(parse_int(&key, value)?);
                }
                "default_command_timeout_ms" => {
                    settings.default_command_timeout_ms =
                        normalize_command_timeout(parse_int(&key, value)?);
                }
                "user_id" | "uid" => settings.user_id = value.to_string(),
                "password" | "pwd" => settings.password = value.to_string(),
                "persist_security_info" => {
                    settings.persist_security_info = parse_bool(&key, value)?;
                }
                "allow_system_calls" => settings.allow_system_calls = parse_bool(&key, value)?,
                "allow_adhoc_queries" => settings.allow_adhoc_queries = parse_bool(&key, value)?,
                "allow_multiple_host_connections" => {
                    settings.allow_multiple_host_connections = parse_bool(&key, value)?;
                }
                "connect_to_all_or_none" => {
                    settings.connect_to_all_or_none = parse_bool(&key, value)?;
                }
                "max_outstanding_txns" => {
                    let n = parse_int(&key, value)?;
                    if n <= 0 {
                        return Err(Error::bad_argument(format!(
                            "max_outstanding_txns must be positive, got {}",
                            n
                        )));
                    }
                    settings.max_outstanding_txns = n as usize;
                }
                "load_balancing_batch_size" => {
                    let n = parse_int(&key, value)?;
                    if n <= 0 {
                        return Err(Error::bad_argument(format!(
                            "load_balancing_batch_size must be positive, got {}",
                            n
                        )));
                    }
                    settings.load_balancing_batch_size = n as u64;
                }
                "trace_enabled" => settings.trace_enabled = parse_bool(&key, value)?,
                "statistics_enabled" => settings.statistics_enabled = parse_bool(&key, value)?,
                other => {
                    return Err(Error::bad_argument(format!(
                        "unknown connection string key: {}",
                        other
                    )));
                }
            }
        }
        Ok(settings)
    }

    /// Render the canonical connection string.
    ///
    /// The password is included only when `persist_security_info` is set, so
    /// `parse(render(s))` reproduces the non-password projection otherwise.
    pub fn render(&self) -> String {
        let mut out = format!(
            "host_list={};port={};connection_timeout_ms={};default_command_timeout_ms={};user_id={}",
            self.host_list,
            self.port,
            self.connection_timeout_ms,
            self.default_command_timeout_ms,
            self.user_id,
        );
        if self.persist_security_info {
            out.push_str(&format!(";password={}", self.password));
        }
        out.push_str(&format!(
            ";persist_security_info={};allow_system_calls={};allow_adhoc_queries={};\
             allow_multiple_host_connections={};connect_to_all_or_none={};\
             max_outstanding_txns={};load_balancing_batch_size={};trace_enabled={};\
             statistics_enabled={}",
            self.persist_security_info,
            self.allow_system_calls,
            self.allow_adhoc_queries,
            self.allow_multiple_host_connections,
            self.connect_to_all_or_none,
            self.max_outstanding_txns,
            self.load_balancing_batch_size,
            self.trace_enabled,
            self.statistics_enabled,
        ));
        out
    }

    /// Resolve the host list into socket addresses, IPv4 preferred.
    ///
    /// Entries are separated by commas and/or whitespace and may carry an
    /// explicit `:port`; otherwise `self.port` applies. Duplicate endpoints
    /// are collapsed unless `allow_multiple_host_connections` is set.
    pub fn resolve_endpoints(&self) -> Result<Vec<SocketAddr>> {
        let mut endpoints = Vec::new();
        for entry in self
            .host_list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|e| !e.is_empty())
        {
            let candidate = if entry.contains(':') {
                entry.to_string()
            } else {
                format!("{}:{}", entry, self.port)
            };
            let mut resolved = candidate
                .to_socket_addrs()
                .map_err(|e| Error::bad_argument(format!("cannot resolve host {}: {}", entry, e)))?
                .collect::<Vec<_>>();
            // Prefer an IPv4 endpoint when the resolver offers both families.
            resolved.sort_by_key(|a| !a.is_ipv4());
            let addr = resolved.into_iter().next().ok_or_else(|| {
                Error::bad_argument(format!("host {} resolved to no addresses", entry))
            })?;
            if self.allow_multiple_host_connections || !endpoints.contains(&addr) {
                endpoints.push(addr);
            }
        }
        if endpoints.is_empty() {
            return Err(Error::bad_argument("host list resolved to no endpoints"));
        }
        Ok(endpoints)
    }

    /// Effective per-command deadline; `None` means infinite.
    pub fn command_timeout(&self) -> Option<Duration> {
        if self.default_command_timeout_ms == TIMEOUT_INFINITE {
            None
        } else {
            Some(Duration::from_millis(self.default_command_timeout_ms as u64))
        }
    }

    /// Connect/handshake deadline; never infinite.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.max(0) as u64)
    }
}
