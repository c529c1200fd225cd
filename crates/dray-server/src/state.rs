/// Shared application state for the daemon.
/// All fields are thread-safe for use with axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use dray_core::config::DrayConfig;
use dray_core::scheduler::Scheduler;

use crate::api_metrics::ApiMetrics;
use crate::history_store::HistoryStore;
use crate::sampler::HealthSnapshot;
use crate::settings_store::SettingsStore;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub start_time: Instant,
    pub config: DrayConfig,
    pub scheduler: Scheduler,
    pub api_metrics: ApiMetrics,
    /// Latest sampler output; `/system/stats/current` serves this cache
    /// and never computes on the request path.
    pub latest_snapshot: RwLock<Option<HealthSnapshot>>,
    pub history: Arc<HistoryStore>,
    pub settings: SettingsStore,
}

impl AppState {
    pub fn new(
        config: DrayConfig,
        scheduler: Scheduler,
        history: Arc<HistoryStore>,
        settings: SettingsStore,
    ) -> Self {
        let api_metrics = ApiMetrics::new(
            config.sampler.api_window_s,
            config.api.excluded_paths.clone(),
        );
        Self {
            inner: Arc::new(AppStateInner {
                start_time: Instant::now(),
                config,
                scheduler,
                api_metrics,
                latest_snapshot: RwLock::new(None),
                history,
                settings,
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}
