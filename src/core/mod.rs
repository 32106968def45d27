//! Core admission, capacity, and dispatch abstractions.

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod pool;
pub mod queue;

pub use backend::{BackendId, BackendSnapshot, BackendUnit, WorkloadClass};
pub use dispatcher::{BatchDispatcher, BatchPolicy};
pub use error::{AppResult, DispatchError};
pub use executor::{BatchExecutor, JobResult};
pub use pool::{BackendPool, ReservationGuard};
pub use queue::{AdmissionQueue, Request, DEFAULT_ADMISSION_CAP};
