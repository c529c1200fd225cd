/// Typed configuration with defaults, TOML file loading, and environment
/// overrides (`DRAY_*`). Values are validated once at load; the rest of the
/// code never re-checks them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::rating::BusyCurves;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrayConfig {
    pub scheduler: SchedulerConfig,
    pub sampler: SamplerConfig,
    pub history: HistoryConfig,
    pub api: ApiConfig,
    pub busy: BusyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total abstract capacity budget for the host.
    pub total_capacity_units: u32,
    /// Fixed headroom always subtracted from the usable budget.
    pub reserve_units: u32,
    pub lease_ttl_s: u64,
    pub heartbeat_grace_s: u64,
    /// Base for the denial backoff: `retry_base_ms * 2^max(0, busy-3)`.
    pub retry_base_ms: u64,
    /// Terminal jobs older than this are evicted from memory.
    pub job_retention_s: u64,
    /// Hard cap on terminal jobs kept in memory.
    pub job_retention_cap: usize,
    /// A busy rating older than this is treated as missing (rating 10).
    pub busy_stale_after_s: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            total_capacity_units: 100,
            reserve_units: 0,
            lease_ttl_s: 30,
            heartbeat_grace_s: 5,
            retry_base_ms: 375,
            job_retention_s: 3600,
            job_retention_cap: 5000,
            busy_stale_after_s: 15,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_duration_ms(&self) -> u64 {
        (self.lease_ttl_s + self.heartbeat_grace_s) * 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_s: u64,
    pub api_window_s: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_s: 5,
            api_window_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_days: u32,
    pub minute_retention_hours: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            minute_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Path prefixes excluded from the API-metrics window (monitoring and
    /// documentation endpoints poll constantly and would drown real traffic).
    pub excluded_paths: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            excluded_paths: vec![
                "/system/stats/current".to_string(),
                "/scheduler/status".to_string(),
                "/healthz".to_string(),
                "/docs".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyConfig {
    /// API p95 latency considered "at threshold" (score 5).
    pub p95_threshold_ms: f64,
    /// Inflight request count considered "at threshold".
    pub inflight_threshold: f64,
    /// Requests/sec soft ceiling.
    pub rps_soft_ceiling: f64,
    pub curves: BusyCurves,
}

impl Default for BusyConfig {
    fn default() -> Self {
        Self {
            p95_threshold_ms: 750.0,
            inflight_threshold: 32.0,
            rps_soft_ceiling: 50.0,
            curves: BusyCurves::default(),
        }
    }
}

impl DrayConfig {
    /// Load config from an optional TOML file, apply `DRAY_*` environment
    /// overrides, and validate. A missing file means defaults; a malformed
    /// file or invalid value is a startup error.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| format!("failed to read {}: {}", p.display(), e))?;
                toml::from_str(&raw).map_err(|e| format!("failed to parse {}: {}", p.display(), e))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DRAY_*` environment overrides on top of file/default values.
    pub fn apply_env(&mut self) {
        env_parse("DRAY_TOTAL_CAPACITY_UNITS", &mut self.scheduler.total_capacity_units);
        env_parse("DRAY_RESERVE_UNITS", &mut self.scheduler.reserve_units);
        env_parse("DRAY_LEASE_TTL_S", &mut self.scheduler.lease_ttl_s);
        env_parse("DRAY_HEARTBEAT_GRACE_S", &mut self.scheduler.heartbeat_grace_s);
        env_parse("DRAY_RETRY_BASE_MS", &mut self.scheduler.retry_base_ms);
        env_parse("DRAY_SAMPLER_INTERVAL_S", &mut self.sampler.interval_s);
        env_parse("DRAY_API_WINDOW_S", &mut self.sampler.api_window_s);
        env_parse("DRAY_HISTORY_RETENTION_DAYS", &mut self.history.retention_days);
        env_parse("DRAY_MINUTE_RETENTION_HOURS", &mut self.history.minute_retention_hours);

        if let Ok(raw) = std::env::var("DRAY_EXCLUDED_API_PATHS") {
            self.api.excluded_paths = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.total_capacity_units == 0 {
            return Err("scheduler.total_capacity_units must be >= 1".into());
        }
        if self.scheduler.reserve_units > self.scheduler.total_capacity_units {
            return Err(format!(
                "scheduler.reserve_units ({}) exceeds total_capacity_units ({})",
                self.scheduler.reserve_units, self.scheduler.total_capacity_units
            ));
        }
        if self.scheduler.lease_ttl_s == 0 {
            return Err("scheduler.lease_ttl_s must be >= 1".into());
        }
        if self.scheduler.retry_base_ms == 0 {
            return Err("scheduler.retry_base_ms must be >= 1".into());
        }
        if self.sampler.interval_s == 0 {
            return Err("sampler.interval_s must be >= 1".into());
        }
        if self.sampler.api_window_s == 0 {
            return Err("sampler.api_window_s must be >= 1".into());
        }
        if self.history.retention_days == 0 {
            return Err("history.retention_days must be >= 1".into());
        }
        if self.history.minute_retention_hours == 0 {
            return Err("history.minute_retention_hours must be >= 1".into());
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}
