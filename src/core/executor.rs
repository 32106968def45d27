//! Batch execution contract.

use async_trait::async_trait;

use crate::core::backend::BackendSnapshot;
use crate::core::error::DispatchError;
use crate::core::queue::Request;

/// Outcome of one request, positionally aligned with the input batch.
#[derive(Debug, Clone)]
pub enum JobResult<R> {
    /// The request completed; `R` is the generated artifact.
    Success(R),
    /// The request failed with a human-readable message.
    Error(String),
}

impl<R> JobResult<R> {
    /// Whether this outcome is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Abstraction over the external system that runs a finalized batch on a
/// reserved backend.
///
/// The dispatcher calls this once per batch, with a snapshot of the reserved
/// unit (url and credential included) so the executor can talk to it. An
/// `Err` return, or a result vector shorter than the batch, becomes a uniform
/// per-request failure; the dispatcher never retries.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use render_dispatch::core::{BackendSnapshot, BatchExecutor, DispatchError, JobResult, Request};
///
/// #[derive(Clone)]
/// struct ComfyExecutor;
///
/// #[async_trait]
/// impl BatchExecutor<String, Vec<u8>> for ComfyExecutor {
///     async fn execute(
///         &self,
///         batch: &[Request<String, Vec<u8>>],
///         backend: BackendSnapshot,
///     ) -> Result<Vec<JobResult<Vec<u8>>>, DispatchError> {
///         // POST each prompt to backend.url, collect image bytes...
///         Ok(batch.iter().map(|_| JobResult::Success(Vec::new())).collect())
///     }
/// }
/// ```
#[async_trait]
pub trait BatchExecutor<P, R>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Run `batch` on `backend`, returning one outcome per request in order.
    async fn execute(
        &self,
        batch: &[Request<P, R>],
        backend: BackendSnapshot,
    ) -> Result<Vec<JobResult<R>>, DispatchError>;
}
