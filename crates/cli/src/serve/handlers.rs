//! Pipeline state routes, scoped by scenario.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fabric_state::{
    CheckStalenessRequest, InvalidateRequest, LoadStateRequest, MarkStageValidRequest,
    SaveStateRequest, Stage, StateError,
};
use serde::de::DeserializeOwned;
use tracing::error;

use super::json_error;
use super::state::AppState;

/// Error body: `{"error": message, "code": TAXONOMY_CODE}`.
fn state_error(err: StateError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(code = err.code(), error = %err, "state request failed");
    }
    (
        status,
        Json(serde_json::json!({"error": err.to_string(), "code": err.code()})),
    )
        .into_response()
}

/// Decode a JSON body; an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(raw).map_err(|e| {
        json_error(
            StatusCode::BAD_REQUEST,
            &format!("invalid request body: {}", e),
        )
        .into_response()
    })
}

fn ok<T: serde::Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

/// GET /api/v1/scenarios/states
pub(crate) async fn handle_list_states(State(state): State<Arc<AppState>>) -> Response {
    match state.states.list_states().await {
        Ok(states) => ok(serde_json::json!({ "states": states })),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/scenarios/{scenario}/state
pub(crate) async fn handle_load_state(
    State(state): State<Arc<AppState>>,
    Path(scenario): Path<String>,
    Query(request): Query<LoadStateRequest>,
) -> Response {
    match state.states.load_state(&scenario, &request).await {
        Ok(response) => ok(response),
        Err(e) => state_error(e),
    }
}

/// PUT /api/v1/scenarios/{scenario}/state
///
/// A hash conflict is a 200 with `conflict=true`; the client merges.
pub(crate) async fn handle_save_state(
    State(state): State<Arc<AppState>>,
    Path(scenario): Path<String>,
    body: Bytes,
) -> Response {
    let request: SaveStateRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.states.save_state(&scenario, request).await {
        Ok(response) => ok(response),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/scenarios/{scenario}/state
pub(crate) async fn handle_clear_state(
    State(state): State<Arc<AppState>>,
    Path(scenario): Path<String>,
) -> Response {
    match state.states.clear_state(&scenario).await {
        Ok(response) => ok(response),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/scenarios/{scenario}/state/check
pub(crate) async fn handle_check_staleness(
    State(state): State<Arc<AppState>>,
    Path(scenario): Path<String>,
    body: Bytes,
) -> Response {
    let request: CheckStalenessRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.states.check_staleness(&scenario, request).await {
        Ok(response) => ok(response),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/scenarios/{scenario}/state/logs/{service}
pub(crate) async fn handle_get_logs(
    State(state): State<Arc<AppState>>,
    Path((scenario, service)): Path<(String, String)>,
) -> Response {
    match state.states.get_logs(&scenario, &service).await {
        Ok(Some(logs)) => ok(logs),
        Ok(None) => state_error(StateError::NotFound {
            scenario,
            what: format!("logs for service '{}'", service),
        }),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/scenarios/{scenario}/state/invalidate
pub(crate) async fn handle_invalidate(
    State(state): State<Arc<AppState>>,
    Path(scenario): Path<String>,
    body: Bytes,
) -> Response {
    let request: InvalidateRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state
        .states
        .invalidate_stages_from(&scenario, request.from_stage, &request.reason)
        .await
    {
        Ok(status) => ok(status),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/scenarios/{scenario}/state/stages/{stage}/validate
pub(crate) async fn handle_mark_stage_valid(
    State(state): State<Arc<AppState>>,
    Path((scenario, stage)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let stage: Stage = match stage.parse() {
        Ok(s) => s,
        Err(e) => return state_error(e),
    };
    let request: MarkStageValidRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state
        .states
        .mark_stage_valid(&scenario, stage, request.fingerprint, request.result)
        .await
    {
        Ok(saved) => ok(saved),
        Err(e) => state_error(e),
    }
}
