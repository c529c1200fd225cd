use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::api::{bad_request, iso, storage_error_response};
use crate::state::AppState;

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub days: Option<u32>,
}

/// GET /scheduler/history/stats?days=
pub async fn get_stats(State(state): State<AppState>, Query(params): Query<StatsQuery>) -> Response {
    let days = params.days.unwrap_or(7);
    if days == 0 {
        return bad_request("days must be >= 1");
    }
    match state.inner.history.stats(days, unix_ms()) {
        Ok(stats) => Json(json!(stats)).into_response(),
        Err(e) => storage_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /scheduler/history/events?limit= — newest first.
pub async fn get_events(
    State(state): State<AppState>,
    Query(params): Query<EventsQuery>,
) -> Response {
    let limit = params.limit.unwrap_or(100).min(1000);
    match state.inner.history.recent_events(limit) {
        Ok(events) => {
            let rendered: Vec<serde_json::Value> = events
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "ts": iso(e.ts),
                        "entity_kind": e.entity_kind,
                        "entity_id": e.entity_id,
                        "type": e.event_type,
                        "data": e.data,
                    })
                })
                .collect();
            let count = rendered.len();
            Json(json!({ "events": rendered, "count": count })).into_response()
        }
        Err(e) => storage_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct CleanupQuery {
    pub days: Option<u32>,
}

/// POST /scheduler/history/cleanup?days= — on-demand prune.
pub async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupQuery>,
) -> Response {
    let days = params.days.unwrap_or(state.inner.config.history.retention_days);
    if days == 0 {
        return bad_request("days must be >= 1");
    }
    match state.inner.history.cleanup_jobs(days, unix_ms()) {
        Ok((rows, events)) => {
            info!(rows, events, days, "history cleanup via API");
            Json(json!({ "ok": true, "deleted_jobs": rows, "deleted_events": events })).into_response()
        }
        Err(e) => storage_error_response(e),
    }
}
