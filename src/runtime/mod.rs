//! Tokio-spawned loops and the submission facade.

pub mod handle;

pub use handle::{DispatchHandle, Ticket};
