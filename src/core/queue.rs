//! Admission queue: an ordered multiset of pending requests with a
//! per-submitter cap over pending-or-in-flight work.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::backend::WorkloadClass;
use crate::core::error::DispatchError;
use crate::core::executor::JobResult;
use crate::util::clock::now_ms;

/// Maximum pending-or-in-flight requests per submitter.
pub const DEFAULT_ADMISSION_CAP: usize = 2;

/// One generation request.
///
/// Immutable after construction except for `started_at_ms`, which only the
/// dispatcher writes. Owned by the queue until dispatched, then by the
/// dispatch loop until the executor returns.
#[derive(Debug)]
pub struct Request<P, R> {
    /// Unique request identifier.
    pub id: Uuid,
    /// Ordering priority; lower values dispatch sooner.
    pub priority: u8,
    /// Identity of the submitter, used for the admission cap.
    pub submitter: u64,
    /// Workload class selecting capacity requirement and batching.
    pub class: WorkloadClass,
    /// Opaque payload handed to the executor.
    pub payload: P,
    /// Submission timestamp, ms since epoch; FIFO tie-break within a priority.
    pub submitted_at_ms: u128,
    /// Set by the dispatcher when the batch starts executing.
    pub started_at_ms: Option<u128>,
    pub(crate) reply: Option<oneshot::Sender<JobResult<R>>>,
}

impl<P, R> Request<P, R> {
    /// Create a request and the receiver its outcome will be delivered on.
    ///
    /// Dropping the receiver is the only form of cancellation: the request
    /// still runs, but its outcome is discarded.
    pub fn new(
        priority: u8,
        submitter: u64,
        class: WorkloadClass,
        payload: P,
    ) -> (Self, oneshot::Receiver<JobResult<R>>) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            id: Uuid::new_v4(),
            priority,
            submitter,
            class,
            payload,
            submitted_at_ms: now_ms(),
            started_at_ms: None,
            reply: Some(tx),
        };
        (req, rx)
    }

    /// Deliver the outcome to the submitter, if anyone is still listening.
    pub(crate) fn resolve(&mut self, result: JobResult<R>) {
        if let Some(tx) = self.reply.take() {
            // A dropped receiver means the submitter abandoned the request.
            let _ = tx.send(result);
        }
    }
}

/// Heap entry ordering requests by (priority asc, timestamp asc, seq asc).
///
/// The sequence number guarantees FIFO within a priority even when two
/// submissions land in the same millisecond.
struct QueuedRequest<P, R> {
    seq: u64,
    req: Request<P, R>,
}

impl<P, R> PartialEq for QueuedRequest<P, R> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<P, R> Eq for QueuedRequest<P, R> {}

impl<P, R> PartialOrd for QueuedRequest<P, R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P, R> Ord for QueuedRequest<P, R> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the lowest (priority,
        // timestamp, seq) triple surfaces first.
        other
            .req
            .priority
            .cmp(&self.req.priority)
            .then_with(|| other.req.submitted_at_ms.cmp(&self.req.submitted_at_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<P, R> {
    heap: BinaryHeap<QueuedRequest<P, R>>,
    /// Requests dispatched but not yet completed, per submitter. Together
    /// with a heap scan this makes the admission cap cover in-flight work.
    in_flight: HashMap<u64, usize>,
    next_seq: u64,
}

/// Priority queue of pending requests with per-submitter admission control.
pub struct AdmissionQueue<P, R> {
    state: Mutex<QueueState<P, R>>,
    notify: Notify,
    cap: usize,
}

impl<P, R> AdmissionQueue<P, R> {
    /// Create a queue with the given per-submitter cap.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                in_flight: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            cap,
        }
    }

    /// Admit a request, returning the resulting queue depth.
    ///
    /// Rejects with [`DispatchError::AdmissionRejected`] when the submitter
    /// already has `cap` requests pending or in flight. The pending count is
    /// a heap scan; queue depth stays small because it is bounded by the cap
    /// times the number of active submitters.
    pub fn submit(&self, req: Request<P, R>) -> Result<usize, DispatchError> {
        let depth = {
            let mut state = self.state.lock();
            let pending = state
                .heap
                .iter()
                .filter(|q| q.req.submitter == req.submitter)
                .count();
            let active = state.in_flight.get(&req.submitter).copied().unwrap_or(0);
            if pending + active >= self.cap {
                tracing::debug!(
                    submitter = req.submitter,
                    pending,
                    active,
                    "admission rejected"
                );
                return Err(DispatchError::AdmissionRejected(req.submitter));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            tracing::debug!(
                request = %req.id,
                submitter = req.submitter,
                priority = req.priority,
                class = %req.class,
                "request admitted"
            );
            state.heap.push(QueuedRequest { seq, req });
            state.heap.len()
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Pop the highest-priority, earliest request, suspending until one is
    /// available or `deadline` elapses. `None` deadline blocks indefinitely.
    ///
    /// The popped request's submitter is counted as in flight until
    /// [`complete`](Self::complete) is called for it.
    pub async fn take_next(&self, deadline: Option<Instant>) -> Option<Request<P, R>> {
        loop {
            // Arm the notification before checking so a submit between the
            // check and the wait is not lost.
            let notified = self.notify.notified();
            if let Some(req) = self.pop() {
                return Some(req);
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return self.pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark one of `submitter`'s in-flight requests complete, freeing a slot
    /// under the admission cap.
    pub fn complete(&self, submitter: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&submitter) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&submitter);
            }
        }
    }

    /// Number of requests currently queued (excludes in-flight).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Pending-or-in-flight count for one submitter, as the cap sees it.
    #[must_use]
    pub fn load_of(&self, submitter: u64) -> usize {
        let state = self.state.lock();
        let pending = state
            .heap
            .iter()
            .filter(|q| q.req.submitter == submitter)
            .count();
        pending + state.in_flight.get(&submitter).copied().unwrap_or(0)
    }

    fn pop(&self) -> Option<Request<P, R>> {
        let mut state = self.state.lock();
        let req = state.heap.pop()?.req;
        *state.in_flight.entry(req.submitter).or_insert(0) += 1;
        Some(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> AdmissionQueue<&'static str, ()> {
        AdmissionQueue::new(DEFAULT_ADMISSION_CAP)
    }

    fn request(priority: u8, submitter: u64, payload: &'static str) -> Request<&'static str, ()> {
        Request::new(priority, submitter, WorkloadClass::Standard, payload).0
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let q = queue();
        q.submit(request(1, 1, "first-normal")).unwrap();
        q.submit(request(0, 2, "admin")).unwrap();
        q.submit(request(1, 3, "second-normal")).unwrap();

        let deadline = Some(Instant::now() + std::time::Duration::from_millis(50));
        assert_eq!(q.take_next(deadline).await.unwrap().payload, "admin");
        assert_eq!(q.take_next(deadline).await.unwrap().payload, "first-normal");
        assert_eq!(q.take_next(deadline).await.unwrap().payload, "second-normal");
    }

    #[tokio::test]
    async fn fifo_holds_within_same_millisecond() {
        let q = queue();
        for i in 0..4u64 {
            q.submit(request(1, 10 + i, ["a", "b", "c", "d"][i as usize]))
                .unwrap();
        }
        let deadline = Some(Instant::now() + std::time::Duration::from_millis(50));
        for expected in ["a", "b", "c", "d"] {
            assert_eq!(q.take_next(deadline).await.unwrap().payload, expected);
        }
    }

    #[tokio::test]
    async fn admission_cap_counts_pending_and_in_flight() {
        let q = queue();
        assert_eq!(q.submit(request(1, 7, "one")).unwrap(), 1);
        assert_eq!(q.submit(request(1, 7, "two")).unwrap(), 2);
        assert!(matches!(
            q.submit(request(1, 7, "three")),
            Err(DispatchError::AdmissionRejected(7))
        ));

        // Dispatching does not free a slot; the request is still in flight.
        let taken = q.take_next(None).await.unwrap();
        assert_eq!(taken.submitter, 7);
        assert!(q.submit(request(1, 7, "still-over")).is_err());
        assert_eq!(q.load_of(7), 2);

        // Completion does.
        q.complete(7);
        assert_eq!(q.submit(request(1, 7, "admitted")).unwrap(), 2);
    }

    #[tokio::test]
    async fn cap_is_per_submitter() {
        let q = queue();
        q.submit(request(1, 1, "a")).unwrap();
        q.submit(request(1, 1, "b")).unwrap();
        assert!(q.submit(request(1, 1, "c")).is_err());
        assert!(q.submit(request(1, 2, "other")).is_ok());
    }

    #[tokio::test]
    async fn take_next_times_out_on_empty_queue() {
        let q = queue();
        let deadline = Some(Instant::now() + std::time::Duration::from_millis(30));
        assert!(q.take_next(deadline).await.is_none());
    }

    #[tokio::test]
    async fn take_next_wakes_on_submit() {
        let q = std::sync::Arc::new(queue());
        let waiter = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.take_next(None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.submit(request(1, 5, "late")).unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.payload, "late");
    }
}
