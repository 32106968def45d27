//! Configuration models for the dispatcher and backend fleet.

pub mod dispatch;

pub use dispatch::{BackendConfig, DispatchConfig, DEFAULT_BACKEND_URL};
