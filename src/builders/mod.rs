//! Builders to construct dispatcher components from configuration.

pub mod dispatch_builder;

pub use dispatch_builder::{batch_policy, build_pool, build_queue};
