//! Capacity-aware pool of backend units.
//!
//! The pool is the single source of truth for backend capacity and health.
//! All capacity reads/writes and health mutations happen while holding one
//! `parking_lot::Mutex` over the unit vector; the lock is never held across
//! an await point. Capacity arithmetic is O(1) per call, so the coarse lock
//! is not a contention concern next to the network-bound executor calls that
//! happen outside it.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::backend::{BackendId, BackendSnapshot, BackendUnit, WorkloadClass};
use crate::util::clock::now_ms;

/// Default interval between capacity polls in [`BackendPool::await_available`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool of [`BackendUnit`]s with selection, reservation, and health checking.
pub struct BackendPool {
    units: Mutex<Vec<BackendUnit>>,
    http: reqwest::Client,
    poll_interval: Duration,
    probe_timeout: Duration,
}

impl BackendPool {
    /// Create a pool over a fixed, ordered fleet of units.
    #[must_use]
    pub fn new(units: Vec<BackendUnit>) -> Self {
        Self::with_timing(units, DEFAULT_POLL_INTERVAL, DEFAULT_PROBE_TIMEOUT)
    }

    /// Create a pool with explicit poll interval and probe timeout.
    #[must_use]
    pub fn with_timing(
        units: Vec<BackendUnit>,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            units: Mutex::new(units),
            http: reqwest::Client::new(),
            poll_interval,
            probe_timeout,
        }
    }

    /// Number of units in the fleet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.lock().len()
    }

    /// Whether the fleet is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.lock().is_empty()
    }

    /// Best-fit selection: among units that can accept `class`, the one with
    /// the greatest free VRAM. Ties resolve to the first in configured order.
    ///
    /// Best-fit-by-slack spreads load and keeps a large workload from starving
    /// on a fully packed small unit.
    #[must_use]
    pub fn select_best(&self, class: WorkloadClass) -> Option<BackendId> {
        let units = self.units.lock();
        let mut best: Option<(usize, f64)> = None;
        for (i, unit) in units.iter().enumerate() {
            if !unit.can_accept(class) {
                continue;
            }
            let free = unit.free_vram();
            match best {
                Some((_, best_free)) if free <= best_free => {}
                _ => best = Some((i, free)),
            }
        }
        best.map(|(i, _)| BackendId(i))
    }

    /// Reserve capacity for one job of `class` on `id`, returning a guard that
    /// releases the reservation when dropped. Every exit path of a dispatch,
    /// including executor failure, releases exactly once.
    pub fn reserve(&self, id: BackendId, class: WorkloadClass) -> ReservationGuard<'_> {
        {
            let mut units = self.units.lock();
            if let Some(unit) = units.get_mut(id.0) {
                unit.reserve(class);
                tracing::debug!(
                    backend = %id,
                    class = %class,
                    free_vram = unit.free_vram(),
                    "reserved capacity"
                );
            }
        }
        ReservationGuard {
            pool: self,
            id,
            class,
        }
    }

    /// Release capacity for one job of `class` on `id`.
    pub fn release(&self, id: BackendId, class: WorkloadClass) {
        let mut units = self.units.lock();
        if let Some(unit) = units.get_mut(id.0) {
            unit.release(class);
            tracing::debug!(
                backend = %id,
                class = %class,
                free_vram = unit.free_vram(),
                "released capacity"
            );
        }
    }

    /// Poll [`select_best`](Self::select_best) until a unit is available or
    /// `timeout` elapses. Returns `None` on timeout.
    ///
    /// This is the backpressure mechanism: callers suspend rather than fail
    /// fast, smoothing short bursts of contention.
    pub async fn await_available(
        &self,
        class: WorkloadClass,
        timeout: Duration,
    ) -> Option<BackendId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = self.select_best(class) {
                return Some(id);
            }
            if Instant::now() >= deadline {
                tracing::warn!(class = %class, "timed out waiting for backend capacity");
                return None;
            }
            tokio::time::sleep_until(deadline.min(Instant::now() + self.poll_interval)).await;
        }
    }

    /// Probe `{url}/system_stats` and record the result on the unit.
    ///
    /// Any probe failure, network error or non-success status alike, marks the
    /// unit unhealthy until the next successful probe. The HTTP round trip
    /// happens outside the pool lock.
    pub async fn health_check(&self, id: BackendId) -> bool {
        let Some((url, api_key)) = ({
            let units = self.units.lock();
            units.get(id.0).map(|u| (u.url.clone(), u.api_key.clone()))
        }) else {
            return false;
        };

        let mut req = self
            .http
            .get(format!("{url}/system_stats"))
            .timeout(self.probe_timeout);
        if let Some(key) = api_key {
            // Keys of the form `user:pass` are sent as Basic auth, anything
            // else as a Bearer token.
            req = match key.split_once(':') {
                Some((user, pass)) => req.basic_auth(user, Some(pass)),
                None => req.bearer_auth(key),
            };
        }

        let healthy = match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::warn!(backend = %id, error = %err, "health probe failed");
                false
            }
        };

        let mut units = self.units.lock();
        if let Some(unit) = units.get_mut(id.0) {
            if unit.is_healthy != healthy {
                tracing::info!(backend = %id, healthy, "backend health changed");
            }
            unit.is_healthy = healthy;
            unit.last_check_ms = now_ms();
        }
        healthy
    }

    /// Probe every unit in the fleet once.
    pub async fn check_all(&self) {
        let count = self.len();
        for i in 0..count {
            self.health_check(BackendId(i)).await;
        }
    }

    /// Read-only snapshots of all units for dashboards and health commands.
    /// No core logic depends on this being read.
    #[must_use]
    pub fn status(&self) -> Vec<BackendSnapshot> {
        let units = self.units.lock();
        units
            .iter()
            .enumerate()
            .map(|(i, u)| u.snapshot(BackendId(i)))
            .collect()
    }

    /// Snapshot of a single unit, if it exists.
    #[must_use]
    pub fn snapshot_of(&self, id: BackendId) -> Option<BackendSnapshot> {
        let units = self.units.lock();
        units.get(id.0).map(|u| u.snapshot(id))
    }

    /// Force a unit's health flag, for tests and admin overrides.
    pub fn set_healthy(&self, id: BackendId, healthy: bool) {
        let mut units = self.units.lock();
        if let Some(unit) = units.get_mut(id.0) {
            unit.is_healthy = healthy;
            unit.last_check_ms = now_ms();
        }
    }
}

/// RAII guard for a capacity reservation; releases on drop.
pub struct ReservationGuard<'a> {
    pool: &'a BackendPool,
    id: BackendId,
    class: WorkloadClass,
}

impl ReservationGuard<'_> {
    /// The backend this reservation is held on.
    #[must_use]
    pub fn backend(&self) -> BackendId {
        self.id
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        self.pool.release(self.id, self.class);
    }
}
