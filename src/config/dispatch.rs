//! Dispatcher and backend-fleet configuration structures.

use serde::{Deserialize, Serialize};

use crate::core::backend::DEFAULT_TOTAL_VRAM_GB;

/// Endpoint used when no backend is configured at all.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8188";

/// One configured backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Endpoint URL.
    pub url: String,
    /// Optional credential; `user:pass` keys are sent as Basic auth,
    /// anything else as a Bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Total VRAM budget in GiB.
    #[serde(default = "default_vram")]
    pub total_vram_gb: f64,
}

fn default_vram() -> f64 {
    DEFAULT_TOTAL_VRAM_GB
}

/// Root dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ordered backend fleet. Empty means a single default unit at
    /// [`DEFAULT_BACKEND_URL`] with the default VRAM budget.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Maximum pending-or-in-flight requests per submitter.
    #[serde(default = "default_admission_cap")]
    pub admission_cap: usize,
    /// Maximum requests per batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Batch collection window in milliseconds.
    #[serde(default = "default_collect_window_ms")]
    pub collect_window_ms: u64,
    /// How long a batch waits for backend capacity, in seconds.
    #[serde(default = "default_capacity_wait_secs")]
    pub capacity_wait_secs: u64,
    /// Capacity poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Liveness probe timeout in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Interval between fleet-wide health sweeps, in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_admission_cap() -> usize {
    crate::core::queue::DEFAULT_ADMISSION_CAP
}

fn default_max_batch() -> usize {
    crate::core::dispatcher::DEFAULT_MAX_BATCH
}

fn default_collect_window_ms() -> u64 {
    2_000
}

fn default_capacity_wait_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_health_interval_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            admission_cap: default_admission_cap(),
            max_batch: default_max_batch(),
            collect_window_ms: default_collect_window_ms(),
            capacity_wait_secs: default_capacity_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

impl DispatchConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.admission_cap == 0 {
            return Err("admission_cap must be greater than 0".into());
        }
        if self.max_batch == 0 {
            return Err("max_batch must be greater than 0".into());
        }
        if self.capacity_wait_secs == 0 {
            return Err("capacity_wait_secs must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.probe_timeout_secs == 0 {
            return Err("probe_timeout_secs must be greater than 0".into());
        }
        for backend in &self.backends {
            if backend.url.trim().is_empty() {
                return Err("backend url must not be empty".into());
            }
            if backend.total_vram_gb <= 0.0 {
                return Err(format!(
                    "backend `{}` total_vram_gb must be greater than 0",
                    backend.url
                ));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment (with `.env` support).
    ///
    /// `RD_BACKEND_URLS` is a comma-separated endpoint list with VRAM budgets
    /// taken positionally from `RD_BACKEND_VRAM_GB`; `RD_BACKEND_API_KEY`
    /// applies to the whole fleet. With no fleet configured, a single
    /// `RD_BACKEND_URL` (default [`DEFAULT_BACKEND_URL`]) is used.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();

        let api_key = std::env::var("RD_BACKEND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let urls: Vec<String> = std::env::var("RD_BACKEND_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();

        let vrams: Vec<f64> = match std::env::var("RD_BACKEND_VRAM_GB") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| format!("invalid RD_BACKEND_VRAM_GB entry `{v}`: {e}"))
                })
                .collect::<Result<_, _>>()?,
            Err(_) => Vec::new(),
        };

        let backends = if urls.is_empty() {
            let url = std::env::var("RD_BACKEND_URL")
                .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
            vec![BackendConfig {
                url,
                api_key,
                total_vram_gb: DEFAULT_TOTAL_VRAM_GB,
            }]
        } else {
            urls.into_iter()
                .enumerate()
                .map(|(i, url)| BackendConfig {
                    url,
                    api_key: api_key.clone(),
                    total_vram_gb: vrams.get(i).copied().unwrap_or(DEFAULT_TOTAL_VRAM_GB),
                })
                .collect()
        };

        let cfg = Self {
            backends,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
