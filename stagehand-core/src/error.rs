//! Errors surfaced by the harness to the calling test.

use std::time::Duration;

/// Failures a harness operation can report to the test that drives it.
///
/// Timeouts and setup failures are fatal to the scenario. Response write
/// failures happen on peer handler tasks and reach the test through the
/// peer server's failure sink instead of a return value.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timed out after {timeout:?}: {label}")]
    Timeout { label: String, timeout: Duration },

    #[error("Failed to write {endpoint} response: {reason}")]
    ResponseWrite { endpoint: String, reason: String },

    #[error("Setup failed: {reason}")]
    Setup { reason: String },

    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Probe '{label}' was aborted before producing a result")]
    ProbeAborted { label: String },

    #[error("Probe '{label}' completed while it was expected to be blocked")]
    ProbeCompleted { label: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Creates a timeout error for a wait described by `label`.
    pub fn timeout(label: impl Into<String>, timeout: Duration) -> Self {
        HarnessError::Timeout {
            label: label.into(),
            timeout,
        }
    }

    /// Creates a setup error from any displayable reason.
    pub fn setup(reason: impl std::fmt::Display) -> Self {
        HarnessError::Setup {
            reason: reason.to_string(),
        }
    }

    /// Checks if this error came from an exceeded wait bound.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
