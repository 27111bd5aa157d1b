//! Unified error types for pfsmon

use std::time::Duration;
use thiserror::Error;

/// Unified error type for all pfsmon operations
#[derive(Error, Debug)]
pub enum PfsError {
    // Pre-execution errors (fatal, abort before any remote action)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Plan error: {0}")]
    Plan(String),

    // Remote execution errors
    #[error("Cannot connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("Command failed on {host} (exit {exit_code}): {stderr}")]
    Exec {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command timed out on {host} after {after:?}")]
    Timeout { host: String, after: Duration },

    // Agent errors
    #[error("Collector agent failed to start on {host}: {message}")]
    AgentStart { host: String, message: String },

    // Metric delivery errors (retried locally, never escalated)
    #[error("Sink write error: {0}")]
    SinkWrite(String),

    // Orchestrator errors
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl PfsError {
    /// Errors that may clear up on their own (unreachable host, slow host)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }

    /// Errors that must abort a run before any host is touched
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plan(_))
    }

    pub fn connect(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using PfsError
pub type Result<T> = std::result::Result<T, PfsError>;
