//! Error types for dispatch operations.

use thiserror::Error;

/// Errors produced by the admission queue, backend pool, and dispatcher.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Submitter already has the maximum pending-or-in-flight requests.
    #[error("submitter {0} is at the admission cap")]
    AdmissionRejected(u64),
    /// No healthy backend had sufficient free capacity within the wait timeout.
    #[error("no backend with sufficient free capacity")]
    CapacityExhausted,
    /// The external executor failed; the message is passed through verbatim.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Backend-specific failure with context (probe errors, transport).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
