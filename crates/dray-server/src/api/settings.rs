use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::api::{not_found, storage_error_response};
use crate::state::AppState;

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// GET /system/settings — all keys.
pub async fn list_all(State(state): State<AppState>) -> Response {
    match state.inner.settings.list() {
        Ok(all) => Json(json!({ "settings": all })).into_response(),
        Err(e) => storage_error_response(e),
    }
}

/// GET /system/settings/:key
pub async fn get_one(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.inner.settings.get(&key) {
        Ok(Some(value)) => Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => not_found(&format!("setting not found: {key}"), "setting_not_found"),
        Err(e) => storage_error_response(e),
    }
}

/// PUT /system/settings/:key — body is the opaque value.
pub async fn put_one(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Response {
    match state.inner.settings.put(&key, &value, unix_ms()) {
        Ok(()) => {
            info!(key = %key, "setting updated via API");
            Json(json!({ "ok": true, "key": key })).into_response()
        }
        Err(e) => storage_error_response(e),
    }
}

/// DELETE /system/settings/:key
pub async fn delete_one(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.inner.settings.delete(&key) {
        Ok(true) => Json(json!({ "ok": true })).into_response(),
        Ok(false) => not_found(&format!("setting not found: {key}"), "setting_not_found"),
        Err(e) => storage_error_response(e),
    }
}
