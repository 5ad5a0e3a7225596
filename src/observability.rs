//! Observability utilities.
//!
//! Driver events are emitted through `tracing` with a stable `event` field so
//! downstream collectors can key on it. Per-execution events are additionally
//! gated by `ConnectionSettings::trace_enabled`; lifecycle events always
//! emit.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ConnectionSettings;

/// Stable event tags carried in the `event` field of driver traces.
pub mod event {
    pub const CONNECTION_OPENED: &str = "connection_opened";
    pub const CONNECTION_CLOSING: &str = "connection_closing";
    pub const CONNECTION_CLOSED: &str = "connection_closed";
    pub const DRAINING_STARTED: &str = "draining_started";
    pub const DRAINING_COMPLETED: &str = "draining_completed";
    pub const EXECUTION_STARTED: &str = "execution_started";
    pub const EXECUTION_COMPLETED: &str = "execution_completed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_TIMEDOUT: &str = "execution_timedout";
    pub const EXECUTION_ABORTED: &str = "execution_aborted";
    pub const MESSAGE: &str = "message";
}

/// Output format for the driver's trace subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceFormat {
    /// Single-line human-readable output.
    #[default]
    Compact,
    /// Structured JSON, one object per event.
    Json,
}

/// Filter directive applied when the settings ask for per-execution traces:
/// debug level also surfaces discarded late responses and dispatch churn.
const VERBOSE_DIRECTIVE: &str = "pulse_client=debug";
/// Filter directive for lifecycle-only tracing.
const LIFECYCLE_DIRECTIVE: &str = "pulse_client=info";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the process-wide subscriber for driver traces. Call once before
/// opening connections; later calls are no-ops.
///
/// The default filter follows the settings: `trace_enabled` widens it to the
/// driver's debug events (late-response discards, reconnect churn), otherwise
/// only lifecycle events pass. An explicit `RUST_LOG` overrides either.
pub fn init_tracing(settings: &ConnectionSettings, format: TraceFormat) {
    let directive = if settings.trace_enabled {
        VERBOSE_DIRECTIVE
    } else {
        LIFECYCLE_DIRECTIVE
    };
    TRACING_INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let registry = tracing_subscriber::registry().with(filter);
        let result = match format {
            TraceFormat::Json => registry.with(fmt::layer().json()).try_init(),
            TraceFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        };
        if let Err(err) = result {
            // The application installed its own subscriber first; driver
            // events flow through that one instead.
            tracing::debug!(
                event = event::MESSAGE,
                "driver subscriber not installed: {err}"
            );
        }
    });
}
