//! Tool fabric routes: discovery, refresh and model tool calls.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fabric_tools::{
    ExecutionContext, RefreshReport, ScenarioStatus, SyncReport, ToolExecutor, ToolRegistry,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::json_error;
use super::state::AppState;

/// Fetch every peer manifest, then bind the result into the executor.
pub(crate) async fn refresh_and_sync(
    registry: &ToolRegistry,
    executor: &ToolExecutor,
) -> (RefreshReport, SyncReport) {
    let refreshed = registry.refresh().await;
    for (scenario, error) in &refreshed.errors {
        warn!(scenario = %scenario, error = %error, "peer manifest unavailable");
    }
    let synced = registry.sync_executor(executor).await;
    (refreshed, synced)
}

/// Availability of every configured peer, sorted by name.
pub(crate) async fn scenario_statuses(registry: &ToolRegistry) -> Vec<ScenarioStatus> {
    let mut tasks = JoinSet::new();
    for scenario in registry.scenarios() {
        let client = registry.client().clone();
        tasks.spawn(async move { client.check_scenario_status(&scenario).await });
    }

    let mut statuses = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(status) => statuses.push(status),
            Err(e) => warn!(error = %e, "status check task failed"),
        }
    }
    statuses.sort_by(|a, b| a.scenario.cmp(&b.scenario));
    statuses
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "scenario": state.scenario,
        "version": env!("CARGO_PKG_VERSION"),
        "peers": state.registry.scenarios(),
    });
    (StatusCode::OK, Json(response))
}

/// GET /api/v1/tools
pub(crate) async fn handle_list_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = serde_json::json!({ "tools": state.registry.tool_definitions() });
    (StatusCode::OK, Json(response))
}

/// GET /api/v1/tools/scenarios
pub(crate) async fn handle_list_scenarios(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let statuses = scenario_statuses(&state.registry).await;
    (StatusCode::OK, Json(serde_json::json!({ "scenarios": statuses })))
}

/// POST /api/v1/tools/refresh
///
/// Per-peer failures are reported in the body; the route itself succeeds.
pub(crate) async fn handle_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _guard = state.refresh_lock.lock().await;
    let (refreshed, synced) = refresh_and_sync(&state.registry, &state.executor).await;
    info!(
        available = refreshed.available.len(),
        tools = refreshed.tool_count,
        "tool refresh requested"
    );
    (
        StatusCode::OK,
        Json(serde_json::json!({ "refresh": refreshed, "sync": synced })),
    )
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    tool_call_id: String,
    tool_name: String,
    /// Raw JSON string from the model. An object is accepted too.
    #[serde(default)]
    arguments: Value,
}

impl ToolCallRequest {
    fn arguments_json(&self) -> String {
        match &self.arguments {
            Value::String(raw) => raw.clone(),
            Value::Null => "{}".to_string(),
            other => other.to_string(),
        }
    }
}

/// POST /api/v1/chats/{chat_id}/tool-calls
///
/// Always answers with the terminal `ToolCallRecord`, failed or not.
pub(crate) async fn handle_tool_call(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    body: Bytes,
) -> Response {
    let request: ToolCallRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", e),
            )
            .into_response()
        }
    };
    if request.tool_call_id.is_empty() || request.tool_name.is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "'tool_call_id' and 'tool_name' are required",
        )
        .into_response();
    }

    let outcome = state
        .executor
        .execute_tool(
            &ExecutionContext::new(),
            &chat_id,
            &request.tool_call_id,
            &request.tool_name,
            &request.arguments_json(),
        )
        .await;
    (StatusCode::OK, Json(outcome.record)).into_response()
}
