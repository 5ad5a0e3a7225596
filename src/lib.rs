//! # PulseDB Client - Rust Driver Core
//!
//! Client driver for PulseDB, a distributed in-memory transactional
//! database, providing:
//! - Stored procedure invocation (and ad-hoc SQL) against one node or a
//!   cluster, synchronously or asynchronously
//! - Bounded outstanding requests with submit-side backpressure
//! - Per-request timeouts and client-side cancellation (at-most-once
//!   visible; nothing is ever retried)
//! - Live per-procedure statistics with latency histograms
//! - Batched round-robin load balancing with background reconnection of
//!   failed nodes
//!
//! ## Architecture
//!
//! ```text
//!   caller → Client facade → ClusterConnection ── live-set dispatch ──┐
//!                                │                                    │
//!                                ├── NodeConnection (h1) ── socket ───┤
//!                                └── NodeConnection (h2) ── socket ───┘
//!   per node: writer lock │ receive loop │ timeout sweeper │ exec cache
//!   shared:   callback executor │ statistics registry
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod cache;
pub mod callbacks;
pub mod client;
pub mod connection;
pub mod stats;
pub mod types;
pub mod wire;

// Internal utilities
pub mod observability;

pub use cache::{CallStatus, UserState};
pub use observability::{init_tracing, TraceFormat};
pub use client::{AdHocFacade, Client, ConnectionInfo, Procedure, StatisticsFacade, SystemFacade};
pub use connection::{
    CallHandle, CallOptions, ClusterConnection, ConnectionStatus, NodeConnection, NodeInfo,
    Response, ResponseCallback,
};
pub use stats::{summarize, Statistics, StatisticsSnapshot};
pub use types::{ConnectionSettings, Error, Result};
pub use wire::protocol::ClusterIdentity;
pub use wire::values::{
    ParamPack, ResultShape, Row, Rowset, Scalar, ScalarColumn, ScalarValue, SingleRow, WireValue,
};
