use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::lease_json;
use crate::state::AppState;

/// GET /scheduler/status — capacity and queue overview.
pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.inner.scheduler.status();
    let leases: Vec<Value> = snapshot.active_leases.iter().map(lease_json).collect();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_secs(),
        "busy_rating": snapshot.busy_rating,
        "total_capacity_units": snapshot.total_capacity_units,
        "usable_capacity_units": snapshot.usable_capacity_units,
        "leased_capacity_units": snapshot.leased_capacity_units,
        "available_capacity_units": snapshot.available_capacity_units,
        "queue_depths": snapshot.queue_depths,
        "queued_jobs": snapshot.queued_jobs,
        "tracked_jobs": snapshot.tracked_jobs,
        "active_leases": leases,
    }))
}
