/// Background health sampler.
///
/// Every `sampler.interval_s` seconds (default 5) this task samples host
/// metrics via `sysinfo`, folds in the rolling API window, derives the
/// busy rating, publishes it to the scheduler, and caches the snapshot
/// for `/system/stats/current`. On the first tick of each new minute the
/// snapshot is persisted through the history channel.
///
/// On shutdown the current tick completes before the task exits.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dray_core::config::BusyConfig;
use dray_core::events::HistoryEvent;
use dray_core::rating::{busy_rating, BusyInputs};

use crate::api_metrics::ApiWindowSnapshot;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    /// Average across logical cores; `None` when CPU data is unavailable.
    pub cpu_percent: Option<f32>,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub load_1: Option<f64>,
    pub logical_cores: usize,
    pub disk_free_mb: u64,
    pub network_rx_bytes_per_s: u64,
    pub network_tx_bytes_per_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Unix seconds at sample time.
    pub ts: u64,
    pub busy_rating: f64,
    pub host: HostStats,
    pub api: ApiWindowSnapshot,
    /// Per-signal 0-10 scores that fed the composite.
    pub signals: BTreeMap<String, f64>,
}

/// Map raw host/API readings to normalized rating inputs. Unavailable
/// readings map to `None` and score the maximum downstream.
pub fn busy_inputs(cfg: &BusyConfig, host: &HostStats, api: &ApiWindowSnapshot) -> BusyInputs {
    BusyInputs {
        cpu_fraction: host.cpu_percent.map(|c| c as f64 / 100.0),
        mem_fraction: if host.memory_total_mb > 0 {
            Some(host.memory_used_mb as f64 / host.memory_total_mb as f64)
        } else {
            None
        },
        load_per_core: host.load_1.and_then(|load| {
            if host.logical_cores > 0 {
                Some(load / host.logical_cores as f64)
            } else {
                None
            }
        }),
        api_p95_ratio: Some(api.latency_ms_p95 / cfg.p95_threshold_ms),
        api_inflight_ratio: Some(api.inflight.max(0) as f64 / cfg.inflight_threshold),
        api_error_rate: Some(api.error_rate),
        api_rps_ratio: Some(api.rps / cfg.rps_soft_ceiling),
    }
}

/// Run the sampling loop. Spawned as a background tokio task from main.
pub async fn run(state: AppState, events: UnboundedSender<HistoryEvent>, cancel: CancellationToken) {
    let mut sys = System::new_all();
    let disks = Disks::new_with_refreshed_list();
    let mut networks = Networks::new_with_refreshed_list();

    // sysinfo needs two refreshes before CPU usage is meaningful.
    tokio::time::sleep(Duration::from_millis(500)).await;
    sys.refresh_all();

    let interval_s = state.inner.config.sampler.interval_s;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_s));
    let mut prev_minute = 0u64;

    info!(interval_s, "health sampler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        sys.refresh_cpu_usage();
        sys.refresh_memory();
        networks.refresh();

        let cpu_percent = if sys.cpus().is_empty() {
            None
        } else {
            Some(sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32)
        };
        let load = System::load_average();
        let (rx_rate, tx_rate) = {
            let rx: u64 = networks.iter().map(|(_, data)| data.received()).sum();
            let tx: u64 = networks.iter().map(|(_, data)| data.transmitted()).sum();
            (rx / interval_s.max(1), tx / interval_s.max(1))
        };

        let host = HostStats {
            cpu_percent,
            memory_used_mb: sys.used_memory() / (1024 * 1024),
            memory_total_mb: sys.total_memory() / (1024 * 1024),
            load_1: Some(load.one),
            logical_cores: sys.cpus().len(),
            disk_free_mb: disks.iter().map(|d| d.available_space() / (1024 * 1024)).sum(),
            network_rx_bytes_per_s: rx_rate,
            network_tx_bytes_per_s: tx_rate,
        };

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let now_s = now_ms / 1000;

        let api = state.inner.api_metrics.snapshot(now_ms);
        let inputs = busy_inputs(&state.inner.config.busy, &host, &api);
        let (rating, signal_scores) = busy_rating(&state.inner.config.busy.curves, &inputs);

        let snapshot = HealthSnapshot {
            ts: now_s,
            busy_rating: rating,
            host,
            api,
            signals: signal_scores
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };

        state.inner.scheduler.set_busy(rating);
        *state.inner.latest_snapshot.write().await = Some(snapshot.clone());

        debug!(
            busy = rating,
            cpu = ?snapshot.host.cpu_percent,
            mem_mb = snapshot.host.memory_used_mb,
            rps = snapshot.api.rps,
            "health sampled"
        );

        // Minute-aligned persistence: first tick in each new minute.
        let minute = now_s / 60;
        if minute > prev_minute {
            prev_minute = minute;
            let _ = events.send(HistoryEvent::MinuteSample {
                ts_s: minute * 60,
                busy: rating,
                snapshot: serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null),
            });
        }
    }

    info!("health sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostStats {
        HostStats {
            cpu_percent: Some(20.0),
            memory_used_mb: 4_096,
            memory_total_mb: 16_384,
            load_1: Some(1.0),
            logical_cores: 8,
            disk_free_mb: 100_000,
            network_rx_bytes_per_s: 0,
            network_tx_bytes_per_s: 0,
        }
    }

    #[test]
    fn inputs_normalize_against_thresholds() {
        let cfg = BusyConfig::default();
        let mut api = ApiWindowSnapshot::default();
        api.latency_ms_p95 = 375.0;
        api.inflight = 16;
        api.rps = 25.0;
        api.error_rate = 0.02;

        let inputs = busy_inputs(&cfg, &host(), &api);
        assert_eq!(inputs.cpu_fraction, Some(0.2));
        assert_eq!(inputs.mem_fraction, Some(0.25));
        assert_eq!(inputs.load_per_core, Some(0.125));
        assert_eq!(inputs.api_p95_ratio, Some(0.5));
        assert_eq!(inputs.api_inflight_ratio, Some(0.5));
        assert_eq!(inputs.api_rps_ratio, Some(0.5));
        assert_eq!(inputs.api_error_rate, Some(0.02));
    }

    #[test]
    fn unreadable_host_readings_become_missing() {
        let cfg = BusyConfig::default();
        let mut h = host();
        h.cpu_percent = None;
        h.memory_total_mb = 0;
        h.logical_cores = 0;

        let inputs = busy_inputs(&cfg, &h, &ApiWindowSnapshot::default());
        assert!(inputs.cpu_fraction.is_none());
        assert!(inputs.mem_fraction.is_none());
        assert!(inputs.load_per_core.is_none());

        // Missing inputs dominate the composite: the scheduler sees 10.
        let (rating, _) = busy_rating(&cfg.curves, &inputs);
        assert_eq!(rating, 10.0);
    }

    #[test]
    fn idle_host_produces_low_rating() {
        let cfg = BusyConfig::default();
        let mut h = host();
        h.cpu_percent = Some(5.0);
        h.memory_used_mb = 1_000;
        h.load_1 = Some(0.2);

        let inputs = busy_inputs(&cfg, &h, &ApiWindowSnapshot::default());
        let (rating, _) = busy_rating(&cfg.curves, &inputs);
        assert_eq!(rating, 0.0);
    }
}
