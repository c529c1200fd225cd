use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use dray_core::job::JobSpec;

use crate::api::{bad_request, error_response, history_row_json, job_json, not_found};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub addon_id: String,
    pub job_type: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    pub requested_units: u32,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub max_runtime_s: Option<u64>,
}

fn default_priority() -> String {
    "normal".to_string()
}

/// POST /scheduler/jobs
pub async fn submit(State(state): State<AppState>, Json(req): Json<SubmitRequest>) -> Response {
    let priority = match req.priority.parse::<dray_core::job::Priority>() {
        Ok(p) => p,
        Err(e) => return bad_request(&e),
    };
    let spec = JobSpec {
        addon_id: req.addon_id,
        job_type: req.job_type,
        priority,
        requested_units: req.requested_units,
        unique: req.unique,
        idempotency_key: req.idempotency_key,
        payload: req.payload.unwrap_or(serde_json::Value::Null),
        tags: req.tags.map(BTreeSet::from_iter).unwrap_or_default(),
        max_runtime_s: req.max_runtime_s,
    };

    match state.inner.scheduler.submit(spec) {
        Ok(outcome) => Json(json!({
            "job_id": outcome.job_id,
            "state": outcome.state,
            "deduplicated": outcome.deduplicated,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub state: Option<String>,
}

/// GET /scheduler/jobs?limit=&state= — newest first.
pub async fn list(State(state): State<AppState>, Query(params): Query<ListQuery>) -> Response {
    let filter = match params.state.as_deref() {
        Some(raw) => match raw.parse::<dray_core::job::JobState>() {
            Ok(s) => Some(s),
            Err(e) => return bad_request(&e),
        },
        None => None,
    };
    let limit = params.limit.unwrap_or(100).min(1000);

    let jobs = state.inner.scheduler.list_jobs(filter, limit);
    let rendered: Vec<serde_json::Value> = jobs.iter().map(job_json).collect();
    let count = rendered.len();
    Json(json!({ "jobs": rendered, "count": count })).into_response()
}

/// GET /scheduler/jobs/:job_id — live job, falling back to the durable
/// history for jobs already evicted from memory.
pub async fn get_one(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    if let Some(job) = state.inner.scheduler.get_job(&job_id) {
        return Json(json!({ "job": job_json(&job), "live": true })).into_response();
    }
    match state.inner.history.get_job_row(&job_id) {
        Ok(Some(row)) => {
            Json(json!({ "job": history_row_json(&row), "live": false })).into_response()
        }
        Ok(None) => not_found(&format!("job not found: {job_id}"), "job_not_found"),
        Err(e) => crate::api::storage_error_response(e),
    }
}

/// DELETE /scheduler/jobs/:job_id — cancel a queued job.
pub async fn cancel(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.inner.scheduler.cancel(&job_id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(&e),
    }
}
