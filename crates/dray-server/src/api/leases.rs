use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use dray_core::scheduler::LeaseOutcome;

use crate::api::{bad_request, error_response, iso, job_json, lease_json};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LeaseRequestBody {
    pub worker_id: String,
    #[serde(default)]
    pub max_units: Option<u32>,
}

/// POST /scheduler/leases/request — the pull primitive. Denial is a 200
/// with a structured body; workers parse, they don't catch exceptions.
pub async fn request(
    State(state): State<AppState>,
    Json(body): Json<LeaseRequestBody>,
) -> Response {
    match state
        .inner
        .scheduler
        .lease_request(&body.worker_id, body.max_units)
    {
        Ok(LeaseOutcome::Granted { lease, job }) => Json(json!({
            "denied": false,
            "lease": lease_json(&lease),
            "job": job_json(&job),
        }))
        .into_response(),
        Ok(LeaseOutcome::Denied {
            reason,
            detail,
            retry_after_ms,
            busy_rating,
            usable_units,
            leased_units,
        }) => Json(json!({
            "denied": true,
            "reason": reason,
            "detail": detail,
            "retry_after_ms": retry_after_ms,
            "busy_rating": busy_rating,
            "usable_capacity_units": usable_units,
            "leased_capacity_units": leased_units,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct HeartbeatBody {
    pub worker_id: String,
}

/// POST /scheduler/leases/:lease_id/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Response {
    match state.inner.scheduler.heartbeat(&lease_id, &body.worker_id) {
        Ok(ack) => Json(json!({
            "ok": true,
            "expires_at": iso(ack.expires_at),
            "state": ack.state,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct CompleteBody {
    pub worker_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// POST /scheduler/leases/:lease_id/complete — idempotent; an unknown
/// lease is a late reconfirmation and still returns ok.
pub async fn complete(
    State(state): State<AppState>,
    Path(lease_id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> Response {
    let status = match body.status.as_str() {
        "completed" => dray_core::scheduler::CompletionStatus::Completed,
        "failed" => dray_core::scheduler::CompletionStatus::Failed,
        other => return bad_request(&format!("status must be completed|failed, got '{other}'")),
    };

    match state.inner.scheduler.complete(
        &lease_id,
        &body.worker_id,
        status,
        body.result,
        body.error,
    ) {
        Ok(known) => Json(json!({ "ok": true, "known_lease": known })).into_response(),
        Err(e) => error_response(&e),
    }
}
