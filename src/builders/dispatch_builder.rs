//! Construct dispatcher components from configuration.

use std::time::Duration;

use crate::config::{BackendConfig, DispatchConfig, DEFAULT_BACKEND_URL};
use crate::core::backend::{BackendUnit, DEFAULT_TOTAL_VRAM_GB};
use crate::core::dispatcher::BatchPolicy;
use crate::core::error::DispatchError;
use crate::core::pool::BackendPool;
use crate::core::queue::AdmissionQueue;

/// Build the backend pool from validated configuration. An empty backend
/// list yields a single default unit.
pub fn build_pool(cfg: &DispatchConfig) -> Result<BackendPool, DispatchError> {
    cfg.validate().map_err(DispatchError::InvalidConfig)?;

    let backends: Vec<BackendConfig> = if cfg.backends.is_empty() {
        vec![BackendConfig {
            url: DEFAULT_BACKEND_URL.to_string(),
            api_key: None,
            total_vram_gb: DEFAULT_TOTAL_VRAM_GB,
        }]
    } else {
        cfg.backends.clone()
    };

    let units = backends
        .into_iter()
        .map(|b| BackendUnit::new(b.url, b.api_key, b.total_vram_gb))
        .collect();

    Ok(BackendPool::with_timing(
        units,
        Duration::from_millis(cfg.poll_interval_ms),
        Duration::from_secs(cfg.probe_timeout_secs),
    ))
}

/// Build the admission queue from configuration.
#[must_use]
pub fn build_queue<P, R>(cfg: &DispatchConfig) -> AdmissionQueue<P, R> {
    AdmissionQueue::new(cfg.admission_cap)
}

/// Derive the batching policy from configuration.
#[must_use]
pub fn batch_policy(cfg: &DispatchConfig) -> BatchPolicy {
    BatchPolicy {
        max_batch: cfg.max_batch,
        collect_window: Duration::from_millis(cfg.collect_window_ms),
        capacity_wait: Duration::from_secs(cfg.capacity_wait_secs),
    }
}
