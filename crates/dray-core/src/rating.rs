/// Busy-rating derivation.
///
/// Each host/API signal is normalized to a 0-10 score through a monotonic
/// piecewise-linear curve, and the composite rating is the *maximum* across
/// signals: one stressed signal must dominate, regardless of how idle the
/// rest of the host is. A signal that is missing or unreadable scores 10 —
/// the scheduler fails closed when it cannot see.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Monotonic piecewise-linear mapping from a raw signal to a 0-10 score.
/// Breakpoints are `(input, score)` pairs with ascending inputs; values
/// outside the breakpoint range clamp to the first/last score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Curve(pub Vec<(f64, f64)>);

impl Curve {
    pub fn eval(&self, x: f64) -> f64 {
        if self.0.is_empty() || x.is_nan() {
            return 10.0;
        }
        let first = self.0[0];
        let last = self.0[self.0.len() - 1];
        if x <= first.0 {
            return first.1.clamp(0.0, 10.0);
        }
        if x >= last.0 {
            return last.1.clamp(0.0, 10.0);
        }
        for pair in self.0.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if x <= x1 {
                let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 1.0 };
                return (y0 + t * (y1 - y0)).clamp(0.0, 10.0);
            }
        }
        last.1.clamp(0.0, 10.0)
    }
}

/// Per-signal curves with conservative defaults. Ratio signals (p95,
/// inflight, rps) are expressed relative to their configured thresholds,
/// so 1.0 means "at the threshold".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyCurves {
    pub cpu_fraction: Curve,
    pub mem_fraction: Curve,
    pub load_per_core: Curve,
    pub api_p95_ratio: Curve,
    pub api_inflight_ratio: Curve,
    pub api_error_rate: Curve,
    pub api_rps_ratio: Curve,
}

impl Default for BusyCurves {
    fn default() -> Self {
        Self {
            cpu_fraction: Curve(vec![(0.30, 0.0), (0.60, 4.0), (0.80, 7.0), (0.95, 10.0)]),
            mem_fraction: Curve(vec![(0.50, 0.0), (0.75, 4.0), (0.85, 7.0), (0.95, 10.0)]),
            load_per_core: Curve(vec![(0.50, 0.0), (1.00, 4.0), (1.50, 7.0), (2.00, 10.0)]),
            api_p95_ratio: Curve(vec![(0.50, 0.0), (1.00, 5.0), (2.00, 10.0)]),
            api_inflight_ratio: Curve(vec![(0.50, 0.0), (1.00, 5.0), (2.00, 10.0)]),
            api_error_rate: Curve(vec![(0.01, 0.0), (0.05, 5.0), (0.20, 10.0)]),
            api_rps_ratio: Curve(vec![(0.50, 0.0), (1.00, 5.0), (2.00, 10.0)]),
        }
    }
}

/// Raw inputs for one rating pass. `None` means the signal could not be
/// sampled this tick and scores the maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusyInputs {
    pub cpu_fraction: Option<f64>,
    pub mem_fraction: Option<f64>,
    pub load_per_core: Option<f64>,
    pub api_p95_ratio: Option<f64>,
    pub api_inflight_ratio: Option<f64>,
    pub api_error_rate: Option<f64>,
    pub api_rps_ratio: Option<f64>,
}

/// Compute the composite busy rating plus the per-signal scores that fed
/// it (kept in the snapshot for diagnosis).
pub fn busy_rating(curves: &BusyCurves, inputs: &BusyInputs) -> (f64, BTreeMap<&'static str, f64>) {
    let score = |curve: &Curve, value: Option<f64>| match value {
        Some(v) => curve.eval(v),
        None => 10.0,
    };

    let mut signals = BTreeMap::new();
    signals.insert("cpu", score(&curves.cpu_fraction, inputs.cpu_fraction));
    signals.insert("memory", score(&curves.mem_fraction, inputs.mem_fraction));
    signals.insert("load", score(&curves.load_per_core, inputs.load_per_core));
    signals.insert("api_p95", score(&curves.api_p95_ratio, inputs.api_p95_ratio));
    signals.insert(
        "api_inflight",
        score(&curves.api_inflight_ratio, inputs.api_inflight_ratio),
    );
    signals.insert(
        "api_error_rate",
        score(&curves.api_error_rate, inputs.api_error_rate),
    );
    signals.insert("api_rps", score(&curves.api_rps_ratio, inputs.api_rps_ratio));

    let rating = signals
        .values()
        .fold(0.0f64, |acc, s| acc.max(*s))
        .clamp(0.0, 10.0);

    (rating, signals)
}
