//! Backend units and workload-class capacity requirements.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// VRAM consumed on a backend while the default workload runs, in GiB.
pub const DEFAULT_VRAM_REQUIRED_GB: f64 = 4.0;

/// Total VRAM assumed for a backend when configuration does not say.
pub const DEFAULT_TOTAL_VRAM_GB: f64 = 16.0;

/// Category of a generation request, determining its capacity requirement
/// and which requests batch together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    /// Plain text-to-image generation.
    Standard,
    /// Generation conditioned on an input image; loads an extra encoder.
    ImageConditioned,
    /// Generation on the alternate model family.
    AlternateModel,
}

impl WorkloadClass {
    /// VRAM this class consumes on a backend while running, in GiB.
    #[must_use]
    pub fn vram_required(self) -> f64 {
        match self {
            Self::Standard => DEFAULT_VRAM_REQUIRED_GB,
            Self::ImageConditioned | Self::AlternateModel => 5.0,
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::ImageConditioned => "image_conditioned",
            Self::AlternateModel => "alternate_model",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkloadClass {
    type Err = std::convert::Infallible;

    /// Unknown class names fall back to [`WorkloadClass::Standard`], whose
    /// requirement equals the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "image_conditioned" => Self::ImageConditioned,
            "alternate_model" => Self::AlternateModel,
            _ => Self::Standard,
        })
    }
}

/// One remote compute backend with a VRAM budget.
///
/// Pure data plus capacity arithmetic; all mutation happens under the
/// [`BackendPool`](crate::core::pool::BackendPool) lock. Constructed once at
/// startup and never destroyed (static fleet).
#[derive(Debug, Clone)]
pub struct BackendUnit {
    /// Endpoint URL, e.g. `http://127.0.0.1:8188`.
    pub url: String,
    /// Optional credential sent with probe and job requests.
    pub api_key: Option<String>,
    /// Total VRAM budget in GiB.
    pub total_vram: f64,
    /// VRAM currently reserved, in GiB. Invariant: `0 <= used <= total`.
    pub used_vram: f64,
    /// Number of jobs currently reserved on this unit.
    pub active_jobs: u32,
    /// Health flag maintained by liveness probes.
    pub is_healthy: bool,
    /// Timestamp of the last health probe, ms since epoch.
    pub last_check_ms: u128,
}

impl BackendUnit {
    /// Create a unit with its full budget free and assumed healthy.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>, total_vram: f64) -> Self {
        Self {
            url: url.into(),
            api_key,
            total_vram,
            used_vram: 0.0,
            active_jobs: 0,
            is_healthy: true,
            last_check_ms: 0,
        }
    }

    /// Unreserved VRAM, in GiB.
    #[must_use]
    pub fn free_vram(&self) -> f64 {
        self.total_vram - self.used_vram
    }

    /// Whether this unit is healthy and has room for one job of `class`.
    #[must_use]
    pub fn can_accept(&self, class: WorkloadClass) -> bool {
        self.is_healthy && self.free_vram() >= class.vram_required()
    }

    /// Reserve capacity for one job of `class`.
    ///
    /// The caller has already verified [`can_accept`](Self::can_accept) under
    /// the pool lock; this does not re-check.
    pub fn reserve(&mut self, class: WorkloadClass) {
        self.used_vram += class.vram_required();
        self.active_jobs += 1;
    }

    /// Release capacity for one job of `class`, floored at zero so an
    /// unmatched release can never drive the bookkeeping negative.
    pub fn release(&mut self, class: WorkloadClass) {
        self.used_vram = (self.used_vram - class.vram_required()).max(0.0);
        self.active_jobs = self.active_jobs.saturating_sub(1);
    }

    /// Read-only projection of this unit for status reporting.
    #[must_use]
    pub fn snapshot(&self, id: BackendId) -> BackendSnapshot {
        BackendSnapshot {
            id,
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            total_vram: self.total_vram,
            free_vram: self.free_vram(),
            active_jobs: self.active_jobs,
            is_healthy: self.is_healthy,
            last_check_ms: self.last_check_ms,
        }
    }
}

/// Stable identifier of a backend within the pool (its configured position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(pub usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Point-in-time view of one backend for dashboards and the executor.
///
/// The credential is carried so the executor can talk to the backend, but it
/// is never serialized into status output.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    /// Pool identifier of the unit.
    pub id: BackendId,
    /// Endpoint URL.
    pub url: String,
    /// Credential for the executor; excluded from serialized status.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Total VRAM budget, GiB.
    pub total_vram: f64,
    /// Free VRAM at snapshot time, GiB.
    pub free_vram: f64,
    /// Jobs reserved at snapshot time.
    pub active_jobs: u32,
    /// Health flag at snapshot time.
    pub is_healthy: bool,
    /// Last probe timestamp, ms since epoch.
    pub last_check_ms: u128,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_vram_tracks_reservations() {
        let mut unit = BackendUnit::new("http://gpu-1:8188", None, 16.0);
        assert!((unit.free_vram() - 16.0).abs() < f64::EPSILON);

        unit.reserve(WorkloadClass::Standard);
        assert!((unit.free_vram() - 12.0).abs() < 1e-9);
        assert_eq!(unit.active_jobs, 1);

        unit.release(WorkloadClass::Standard);
        assert!((unit.free_vram() - 16.0).abs() < 1e-9);
        assert_eq!(unit.active_jobs, 0);
    }

    #[test]
    fn release_never_goes_negative() {
        let mut unit = BackendUnit::new("http://gpu-1:8188", None, 8.0);
        unit.release(WorkloadClass::ImageConditioned);
        unit.release(WorkloadClass::ImageConditioned);
        assert!(unit.used_vram >= 0.0);
        assert_eq!(unit.active_jobs, 0);
        assert!((unit.free_vram() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn used_stays_within_budget_under_guarded_reserves() {
        let mut unit = BackendUnit::new("http://gpu-1:8188", None, 10.0);
        while unit.can_accept(WorkloadClass::Standard) {
            unit.reserve(WorkloadClass::Standard);
        }
        assert!(unit.used_vram <= unit.total_vram);
        assert_eq!(unit.active_jobs, 2);
    }

    #[test]
    fn unhealthy_unit_rejects_all_classes() {
        let mut unit = BackendUnit::new("http://gpu-1:8188", None, 24.0);
        unit.is_healthy = false;
        assert!(!unit.can_accept(WorkloadClass::Standard));
        assert!(!unit.can_accept(WorkloadClass::AlternateModel));
    }

    #[test]
    fn class_parsing_falls_back_to_standard() {
        assert_eq!(
            "image_conditioned".parse::<WorkloadClass>().unwrap(),
            WorkloadClass::ImageConditioned
        );
        let unknown: WorkloadClass = "sdxl_turbo".parse().unwrap();
        assert_eq!(unknown, WorkloadClass::Standard);
        assert!((unknown.vram_required() - DEFAULT_VRAM_REQUIRED_GB).abs() < f64::EPSILON);
    }
}
