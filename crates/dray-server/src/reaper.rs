/// Lease expiry reaper.
///
/// Walks active leases once a second, expiring any past their deadline or
/// over their job's max runtime, and evicts old terminal jobs from memory.
/// The sweep itself lives in the scheduler; this task only drives it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(state: AppState, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    info!("lease reaper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let expired = state.inner.scheduler.expire_sweep();
        if expired > 0 {
            debug!(expired, "reaper expired leases");
        }
    }

    info!("lease reaper stopped");
}
