pub mod history;
pub mod jobs;
pub mod leases;
pub mod settings;
pub mod status;
pub mod system;

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use dray_core::error::SchedError;
use dray_core::job::{Job, JobHistoryRow, Lease};

use crate::auth::{require_auth, ApiToken};
use crate::state::AppState;

/// Map a scheduler error to the HTTP error envelope `{detail, code}`.
/// This is the only layer that turns error kinds into status codes.
pub fn error_response(err: &SchedError) -> Response {
    let status = match err {
        SchedError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
        SchedError::IdempotencyConflict(_) => StatusCode::CONFLICT,
        SchedError::JobNotFound(_) => StatusCode::NOT_FOUND,
        SchedError::LeaseNotFound => StatusCode::NOT_FOUND,
        SchedError::WorkerMismatch => StatusCode::FORBIDDEN,
        SchedError::LeaseInactive => StatusCode::CONFLICT,
        SchedError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "detail": err.to_string(), "code": err.code() })),
    )
        .into_response()
}

pub fn storage_error_response(err: rusqlite::Error) -> Response {
    error_response(&SchedError::Storage(err.to_string()))
}

pub fn not_found(detail: &str, code: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": detail, "code": code })),
    )
        .into_response()
}

pub fn bad_request(detail: &str) -> Response {
    error_response(&SchedError::InvalidArguments(detail.to_string()))
}

/// ISO-8601 UTC rendering for API timestamps (internally everything is
/// unix milliseconds).
pub fn iso(ms: u64) -> serde_json::Value {
    match chrono::DateTime::from_timestamp_millis(ms as i64) {
        Some(dt) => json!(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        None => serde_json::Value::Null,
    }
}

pub fn iso_opt(ms: Option<u64>) -> serde_json::Value {
    ms.map(iso).unwrap_or(serde_json::Value::Null)
}

pub fn job_json(job: &Job) -> serde_json::Value {
    json!({
        "job_id": job.job_id,
        "addon_id": job.addon_id,
        "job_type": job.job_type,
        "priority": job.priority,
        "requested_units": job.requested_units,
        "unique": job.unique,
        "idempotency_key": job.idempotency_key,
        "state": job.state,
        "payload": job.payload,
        "tags": job.tags,
        "max_runtime_s": job.max_runtime_s,
        "lease_id": job.lease_id,
        "created_at": iso(job.created_at),
        "updated_at": iso(job.updated_at),
        "leased_at": iso_opt(job.leased_at),
        "started_at": iso_opt(job.started_at),
        "finished_at": iso_opt(job.finished_at),
        "result": job.result,
        "error": job.error,
    })
}

pub fn lease_json(lease: &Lease) -> serde_json::Value {
    json!({
        "lease_id": lease.lease_id,
        "job_id": lease.job_id,
        "worker_id": lease.worker_id,
        "capacity_units": lease.capacity_units,
        "issued_at": iso(lease.issued_at),
        "expires_at": iso(lease.expires_at),
        "last_heartbeat": iso(lease.last_heartbeat),
    })
}

pub fn history_row_json(row: &JobHistoryRow) -> serde_json::Value {
    json!({
        "job_id": row.job_id,
        "addon_id": row.addon_id,
        "job_type": row.job_type,
        "priority": row.priority,
        "requested_units": row.requested_units,
        "state": row.state,
        "created_at": iso(row.created_at),
        "leased_at": iso_opt(row.leased_at),
        "started_at": iso_opt(row.started_at),
        "finished_at": iso_opt(row.finished_at),
        "queue_wait_s": row.queue_wait_s,
        "runtime_s": row.runtime_s,
        "error": row.error,
        "result": row.result,
    })
}

/// Middleware: record every non-excluded request into the rolling API
/// window. Inflight is decremented on every exit path.
async fn track_requests(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if state.inner.api_metrics.is_excluded(&path) {
        return next.run(req).await;
    }

    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    state.inner.api_metrics.enter();
    let start = Instant::now();
    let resp = next.run(req).await;
    state.inner.api_metrics.exit();

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    state.inner.api_metrics.record(
        now_ms,
        &path,
        &client,
        resp.status().as_u16(),
        start.elapsed().as_secs_f64() * 1000.0,
    );

    resp
}

pub fn build_router(state: AppState, api_token: Option<String>) -> Router {
    Router::new()
        // Scheduler
        .route("/scheduler/jobs", post(jobs::submit).get(jobs::list))
        .route(
            "/scheduler/jobs/:job_id",
            get(jobs::get_one).delete(jobs::cancel),
        )
        .route("/scheduler/leases/request", post(leases::request))
        .route("/scheduler/leases/:lease_id/heartbeat", post(leases::heartbeat))
        .route("/scheduler/leases/:lease_id/complete", post(leases::complete))
        .route("/scheduler/status", get(status::get_status))
        // History
        .route("/scheduler/history/stats", get(history::get_stats))
        .route("/scheduler/history/events", get(history::get_events))
        .route("/scheduler/history/cleanup", post(history::cleanup))
        // System health
        .route("/system/stats/current", get(system::current_stats))
        .route("/system/stats/history", get(system::stats_history))
        .route("/healthz", get(system::healthz))
        // Settings
        .route("/system/settings", get(settings::list_all))
        .route(
            "/system/settings/:key",
            get(settings::get_one)
                .put(settings::put_one)
                .delete(settings::delete_one),
        )
        // Rolling API window, fed by every non-excluded request
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        // Bearer-token auth (no-op when no token is configured)
        .layer(middleware::from_fn(require_auth))
        .layer(Extension(ApiToken(api_token)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
