//! Core types for the PulseDB client driver.
//!
//! This module provides foundational types used throughout the crate:
//! - **Config**: `ConnectionSettings` and connection-string parsing
//! - **Errors**: Driver error taxonomy with thiserror derives

mod config;
mod errors;

pub use config::{
    ConnectionSettings, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_PORT,
    TIMEOUT_INFINITE,
};
pub use errors::{Error, Result};
