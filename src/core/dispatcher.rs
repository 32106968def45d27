//! Batch dispatcher: drains the admission queue into time-bounded,
//! class-homogeneous batches and runs each on a reserved backend.
//!
//! A single cooperative loop drives the whole state machine, so the machine
//! itself needs no lock; the blocking pop and the capacity wait are its only
//! suspension points.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::error::DispatchError;
use crate::core::executor::{BatchExecutor, JobResult};
use crate::core::pool::BackendPool;
use crate::core::queue::{AdmissionQueue, Request};
use crate::util::clock::now_ms;

/// Maximum requests per batch.
pub const DEFAULT_MAX_BATCH: usize = 4;

/// Collection window measured from the first pop of a batch.
pub const DEFAULT_COLLECT_WINDOW: Duration = Duration::from_secs(2);

/// How long a finalized batch waits for backend capacity before failing.
pub const DEFAULT_CAPACITY_WAIT: Duration = Duration::from_secs(120);

/// Tunable batching behaviour.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Batch closes when it reaches this size.
    pub max_batch: usize,
    /// Batch closes when this window elapses, measured from the first pop.
    pub collect_window: Duration,
    /// Capacity wait before a batch fails with `CapacityExhausted`.
    pub capacity_wait: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            collect_window: DEFAULT_COLLECT_WINDOW,
            capacity_wait: DEFAULT_CAPACITY_WAIT,
        }
    }
}

/// States of the dispatch loop. The loop is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    /// No batch being assembled.
    Idle,
    /// First request popped; accumulating more.
    Collecting,
    /// Batch finalized; waiting for a backend.
    Ready,
    /// Backend reserved; executor running.
    Executing,
}

/// Drains the [`AdmissionQueue`] into batches and hands each batch plus a
/// reserved backend to the executor.
pub struct BatchDispatcher<P, R, E> {
    queue: Arc<AdmissionQueue<P, R>>,
    pool: Arc<BackendPool>,
    executor: E,
    policy: BatchPolicy,
    state: DispatchState,
    /// A popped request whose class did not match the batch under assembly;
    /// it seeds the next batch so ordering is preserved.
    carry: Option<Request<P, R>>,
}

impl<P, R, E> BatchDispatcher<P, R, E>
where
    P: Send + Sync + 'static,
    R: Send + 'static,
    E: BatchExecutor<P, R>,
{
    /// Create a dispatcher over a queue, a pool, and an executor.
    pub fn new(
        queue: Arc<AdmissionQueue<P, R>>,
        pool: Arc<BackendPool>,
        executor: E,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            queue,
            pool,
            executor,
            policy,
            state: DispatchState::Idle,
            carry: None,
        }
    }

    /// Run the dispatch loop forever. Intended to be spawned; the owning
    /// handle aborts the task on shutdown.
    pub async fn run(mut self) {
        loop {
            self.run_once().await;
        }
    }

    /// Assemble and dispatch exactly one batch. Exposed so tests can drive
    /// the loop deterministically.
    pub async fn run_once(&mut self) {
        let batch = self.collect_batch().await;
        self.dispatch_batch(batch).await;
        self.transition(DispatchState::Idle);
    }

    fn transition(&mut self, next: DispatchState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "dispatch state");
            self.state = next;
        }
    }

    /// Idle -> Collecting -> (size cap | window elapsed | class change) -> Ready.
    async fn collect_batch(&mut self) -> Vec<Request<P, R>> {
        let first = match self.carry.take() {
            Some(req) => req,
            None => loop {
                if let Some(req) = self.queue.take_next(None).await {
                    break req;
                }
            },
        };
        self.transition(DispatchState::Collecting);

        let class = first.class;
        let deadline = Instant::now() + self.policy.collect_window;
        let mut batch = vec![first];

        while batch.len() < self.policy.max_batch {
            match self.queue.take_next(Some(deadline)).await {
                Some(req) if req.class == class => batch.push(req),
                Some(req) => {
                    // Batches are homogeneous; an incompatible request closes
                    // this one and opens the next.
                    self.carry = Some(req);
                    break;
                }
                None => break,
            }
        }

        self.transition(DispatchState::Ready);
        tracing::debug!(size = batch.len(), class = %class, "batch finalized");
        batch
    }

    /// Ready -> Executing -> Idle, or Ready -> Idle when capacity never comes.
    async fn dispatch_batch(&mut self, mut batch: Vec<Request<P, R>>) {
        let Some(class) = batch.first().map(|r| r.class) else {
            return;
        };

        let Some(id) = self
            .pool
            .await_available(class, self.policy.capacity_wait)
            .await
        else {
            tracing::warn!(size = batch.len(), class = %class, "batch failed: capacity exhausted");
            self.fail_batch(&mut batch, DispatchError::CapacityExhausted.to_string());
            return;
        };

        self.transition(DispatchState::Executing);

        // The guard releases the reservation on every exit path below.
        let guard = self.pool.reserve(id, class);
        let Some(backend) = self.pool.snapshot_of(id) else {
            // The fleet is static, so a dangling id means a construction bug;
            // fail the batch rather than execute against nothing.
            self.fail_batch(&mut batch, DispatchError::Backend("unknown backend".into()).to_string());
            return;
        };

        let started = now_ms();
        for req in &mut batch {
            req.started_at_ms = Some(started);
        }
        tracing::info!(
            size = batch.len(),
            class = %class,
            backend = %backend.id,
            "dispatching batch"
        );

        let outcome = self.executor.execute(&batch, backend).await;
        drop(guard);
        // Free the cap slots before delivery so a submitter who just saw a
        // result can immediately submit again.
        self.finish(&batch);

        match outcome {
            Ok(results) => {
                let mut results = results.into_iter();
                for req in &mut batch {
                    let outcome = results.next().unwrap_or_else(|| {
                        JobResult::Error("executor returned no result for request".into())
                    });
                    req.resolve(outcome);
                }
            }
            Err(err) => {
                // Executor failures are uniform per-request errors, with the
                // executor's own message passed through where available.
                let msg = match err {
                    DispatchError::ExecutorFailure(m) => m,
                    other => other.to_string(),
                };
                tracing::warn!(size = batch.len(), error = %msg, "executor failed");
                for req in &mut batch {
                    req.resolve(JobResult::Error(msg.clone()));
                }
            }
        }
    }

    fn fail_batch(&self, batch: &mut [Request<P, R>], message: String) {
        self.finish(batch);
        for req in batch.iter_mut() {
            req.resolve(JobResult::Error(message.clone()));
        }
    }

    /// Free the admission-cap slots held by a completed batch.
    fn finish(&self, batch: &[Request<P, R>]) {
        for req in batch {
            self.queue.complete(req.submitter);
        }
    }
}
