use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::storage_error_response;
use crate::state::AppState;

/// GET /system/stats/current — cached latest snapshot, never computed on
/// the request path.
pub async fn current_stats(State(state): State<AppState>) -> Response {
    match state.inner.latest_snapshot.read().await.as_ref() {
        Some(snapshot) => Json(json!(snapshot)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "detail": "no health sample collected yet",
                "code": "sampler_warming_up",
            })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<u32>,
}

/// GET /system/stats/history?hours= — persisted minute samples.
pub async fn stats_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Response {
    let retention = state.inner.config.history.minute_retention_hours;
    let hours = params.hours.unwrap_or(retention).min(retention);
    let now_s = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let from_s = now_s.saturating_sub(hours as u64 * 3600);

    match state.inner.history.minute_range(from_s, now_s) {
        Ok(rows) => {
            let count = rows.len();
            Json(json!({
                "samples": rows,
                "count": count,
                "resolution": "1min",
            }))
            .into_response()
        }
        Err(e) => storage_error_response(e),
    }
}

/// GET /healthz — liveness probe, exempt from auth and metrics.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let write_errors = state
        .inner
        .history
        .write_errors
        .load(std::sync::atomic::Ordering::Relaxed);
    Json(json!({
        "status": if write_errors == 0 { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_secs(),
        "storage_write_errors": write_errors,
    }))
}
