//! Running dispatcher: spawned loops and the submission facade.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::builders::{batch_policy, build_pool, build_queue};
use crate::config::DispatchConfig;
use crate::core::backend::{BackendSnapshot, WorkloadClass};
use crate::core::dispatcher::BatchDispatcher;
use crate::core::error::DispatchError;
use crate::core::executor::{BatchExecutor, JobResult};
use crate::core::pool::BackendPool;
use crate::core::queue::{AdmissionQueue, Request};

/// Receipt for an admitted request.
pub struct Ticket<R> {
    /// Queue depth right after admission (position from the back).
    pub queue_depth: usize,
    /// Identifier assigned to the request.
    pub request_id: Uuid,
    /// Resolves to the request's outcome. Dropping it abandons the result.
    pub receiver: oneshot::Receiver<JobResult<R>>,
}

/// A started dispatcher: owns the dispatch and health loops and exposes
/// submission and status.
///
/// Constructed once at process start and passed by reference to submission
/// entry points; there is no hidden global instance.
pub struct DispatchHandle<P, R> {
    queue: Arc<AdmissionQueue<P, R>>,
    pool: Arc<BackendPool>,
    dispatch_task: JoinHandle<()>,
    health_task: Option<JoinHandle<()>>,
}

impl<P, R> DispatchHandle<P, R>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Build the pool and queue from `cfg`, then spawn the dispatch loop and
    /// the periodic health sweep on the current tokio runtime.
    pub fn start<E>(cfg: &DispatchConfig, executor: E) -> Result<Self, DispatchError>
    where
        E: BatchExecutor<P, R>,
    {
        let pool = Arc::new(build_pool(cfg)?);
        let queue: Arc<AdmissionQueue<P, R>> = Arc::new(build_queue(cfg));

        let dispatcher = BatchDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            executor,
            batch_policy(cfg),
        );
        let dispatch_task = tokio::spawn(dispatcher.run());

        let health_task = (cfg.health_interval_secs > 0).then(|| {
            let pool = Arc::clone(&pool);
            let interval = Duration::from_secs(cfg.health_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    pool.check_all().await;
                }
            })
        });

        tracing::info!(backends = pool.len(), "dispatcher started");
        Ok(Self {
            queue,
            pool,
            dispatch_task,
            health_task,
        })
    }

    /// Submit a request. Returns a [`Ticket`] on admission, or
    /// [`DispatchError::AdmissionRejected`] when the submitter is at cap.
    pub fn submit(
        &self,
        priority: u8,
        submitter: u64,
        class: WorkloadClass,
        payload: P,
    ) -> Result<Ticket<R>, DispatchError> {
        let (req, receiver) = Request::new(priority, submitter, class, payload);
        let request_id = req.id;
        let queue_depth = self.queue.submit(req)?;
        Ok(Ticket {
            queue_depth,
            request_id,
            receiver,
        })
    }

    /// Read-only snapshots of the backend fleet.
    #[must_use]
    pub fn status(&self) -> Vec<BackendSnapshot> {
        self.pool.status()
    }

    /// The backend pool, for probes and admin overrides.
    #[must_use]
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Number of requests currently queued.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop the dispatch and health loops. In-flight executor calls are not
    /// awaited; retry policy belongs to the caller.
    pub fn shutdown(&self) {
        self.dispatch_task.abort();
        if let Some(task) = &self.health_task {
            task.abort();
        }
        tracing::info!("dispatcher stopped");
    }
}

impl<P, R> Drop for DispatchHandle<P, R> {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        if let Some(task) = &self.health_task {
            task.abort();
        }
    }
}
