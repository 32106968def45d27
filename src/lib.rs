//! # Render Dispatch
//!
//! Capacity-aware admission, batching, and dispatch for remote
//! image-generation backends.
//!
//! The crate accepts generation requests, admits them under per-submitter and
//! capacity limits, groups compatible requests into batches, and dispatches
//! each batch to one of several remote backends chosen by available VRAM.
//!
//! ## The two hard parts
//!
//! - **Admission queue**: an ordered multiset of pending requests, drained by
//!   priority then submission order, with a per-submitter cap over pending
//!   *and* in-flight work.
//! - **Backend pool**: tracks per-backend VRAM consumption and health under
//!   one lock, picks the unit with the most free capacity for each batch, and
//!   applies backpressure by suspension when the fleet is packed.
//!
//! Everything else is an I/O shim around those two: the executor that talks
//! to a backend's job API is a trait the caller implements, and message
//! formatting, session state, and image handling live outside this crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use render_dispatch::config::DispatchConfig;
//! use render_dispatch::core::WorkloadClass;
//! use render_dispatch::runtime::DispatchHandle;
//!
//! let cfg = DispatchConfig::from_env()?;
//! let handle = DispatchHandle::start(&cfg, my_executor)?;
//!
//! let ticket = handle.submit(1, user_id, WorkloadClass::Standard, prompt)?;
//! println!("queued at depth {}", ticket.queue_depth);
//! let outcome = ticket.receiver.await?;
//! ```
//!
//! Batches close at 4 requests or 2 seconds after the first pop, whichever
//! comes first; a finalized batch waits up to the configured capacity timeout
//! for a backend before every request in it fails with `CapacityExhausted`.
//! Failures are terminal at this layer; retry policy belongs to the caller.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::all)]

/// Builders to construct dispatcher components from configuration.
pub mod builders;
/// Configuration models for the dispatcher and backend fleet.
pub mod config;
/// Core admission, capacity, and dispatch abstractions.
pub mod core;
/// Tokio-spawned loops and the submission facade.
pub mod runtime;
/// Shared utilities.
pub mod util;
