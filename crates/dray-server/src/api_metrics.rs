/// Rolling per-request metrics window.
///
/// The HTTP middleware records every request (path, client, status,
/// duration) into a bounded window; the health sampler reads an aggregate
/// snapshot once per tick. Producers take a short mutex for the push and
/// touch an atomic for inflight tracking, so request overhead stays flat.
/// Monitoring endpoints are excluded so dashboard polling does not count
/// as API pressure. The window is in-memory only; a restart resets it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// How many entries `top_paths` / `top_clients` report.
const TOP_N: usize = 5;

#[derive(Debug, Clone)]
struct RequestSample {
    ts_ms: u64,
    path: String,
    client: String,
    status: u16,
    duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}

/// Aggregate view of the current window, embedded in health snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiWindowSnapshot {
    pub window_s: u64,
    pub total_requests: usize,
    pub rps: f64,
    pub inflight: i64,
    pub latency_ms_avg: f64,
    pub latency_ms_p95: f64,
    pub error_rate: f64,
    pub top_paths: Vec<CountEntry>,
    pub top_clients: Vec<CountEntry>,
}

pub struct ApiMetrics {
    window_ms: u64,
    excluded: Vec<String>,
    inflight: AtomicI64,
    samples: Mutex<VecDeque<RequestSample>>,
}

impl ApiMetrics {
    pub fn new(window_s: u64, excluded: Vec<String>) -> Self {
        Self {
            window_ms: window_s * 1000,
            excluded,
            inflight: AtomicI64::new(0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Excluded paths match by prefix, so `/docs` also covers `/docs/...`.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn enter(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Must run on every exit path, including handler failure.
    pub fn exit(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn record(&self, ts_ms: u64, path: &str, client: &str, status: u16, duration_ms: f64) {
        if self.is_excluded(path) {
            return;
        }
        if let Ok(mut samples) = self.samples.lock() {
            samples.push_back(RequestSample {
                ts_ms,
                path: path.to_string(),
                client: client.to_string(),
                status,
                duration_ms,
            });
            Self::eject_older_than(&mut samples, ts_ms.saturating_sub(self.window_ms));
        }
    }

    fn eject_older_than(samples: &mut VecDeque<RequestSample>, cutoff_ms: u64) {
        while samples.front().is_some_and(|s| s.ts_ms < cutoff_ms) {
            samples.pop_front();
        }
    }

    pub fn snapshot(&self, now_ms: u64) -> ApiWindowSnapshot {
        let window_s = self.window_ms / 1000;
        let mut snapshot = ApiWindowSnapshot {
            window_s,
            inflight: self.inflight(),
            ..ApiWindowSnapshot::default()
        };

        let Ok(mut samples) = self.samples.lock() else {
            return snapshot;
        };
        Self::eject_older_than(&mut samples, now_ms.saturating_sub(self.window_ms));
        if samples.is_empty() {
            return snapshot;
        }

        let total = samples.len();
        let errors = samples.iter().filter(|s| s.status >= 400).count();
        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut paths: HashMap<&str, u64> = HashMap::new();
        let mut clients: HashMap<&str, u64> = HashMap::new();
        for sample in samples.iter() {
            *paths.entry(sample.path.as_str()).or_default() += 1;
            *clients.entry(sample.client.as_str()).or_default() += 1;
        }

        snapshot.total_requests = total;
        snapshot.rps = total as f64 / window_s as f64;
        snapshot.latency_ms_avg = durations.iter().sum::<f64>() / total as f64;
        snapshot.latency_ms_p95 = percentile_95(&durations);
        snapshot.error_rate = errors as f64 / total as f64;
        snapshot.top_paths = top_n(paths);
        snapshot.top_clients = top_n(clients);
        snapshot
    }
}

/// Nearest-rank p95 over an ascending-sorted slice; ties resolve to the
/// lower index.
fn percentile_95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn top_n(counts: HashMap<&str, u64>) -> Vec<CountEntry> {
    let mut entries: Vec<(&str, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .into_iter()
        .take(TOP_N)
        .map(|(name, count)| CountEntry {
            name: name.to_string(),
            count,
        })
        .collect()
}
