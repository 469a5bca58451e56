//! `fabric serve` -- HTTP JSON API for tool discovery, tool calls and
//! pipeline state.
//!
//! Endpoints:
//! - GET    /health
//! - GET    /api/v1/tools                                      - Enabled tool definitions
//! - GET    /api/v1/tools/scenarios                            - Peer availability
//! - POST   /api/v1/tools/refresh                              - Re-fetch manifests, re-bind handlers
//! - POST   /api/v1/chats/{chat_id}/tool-calls                 - Execute one model tool call
//! - GET    /api/v1/scenarios/states                           - Summaries of every stored state
//! - GET    /api/v1/scenarios/{scenario}/state                 - Load
//! - PUT    /api/v1/scenarios/{scenario}/state                 - Save (200 with `conflict` on mismatch)
//! - DELETE /api/v1/scenarios/{scenario}/state                 - Clear
//! - POST   /api/v1/scenarios/{scenario}/state/check           - Staleness check
//! - GET    /api/v1/scenarios/{scenario}/state/logs/{service}  - Decompressed log tail
//! - POST   /api/v1/scenarios/{scenario}/state/invalidate      - Mark stages stale
//! - POST   /api/v1/scenarios/{scenario}/state/stages/{stage}/validate
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod state;
pub(crate) mod tools;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fabric_state::{FileStateStore, StateService, StateStore};
use fabric_tools::{ScenarioClient, ToolExecutor, ToolRegistry, UreqGateway};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use self::handlers::{
    handle_check_staleness, handle_clear_state, handle_get_logs, handle_invalidate,
    handle_list_states, handle_load_state, handle_mark_stage_valid, handle_save_state,
};
use self::state::AppState;
use self::tools::{
    handle_health, handle_list_scenarios, handle_list_tools, handle_not_found, handle_refresh,
    handle_tool_call,
};
use crate::config::Settings;

/// Maximum request body size: 10 MB. Log tails ride along with saves.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

/// Build the tool fabric (client, registry, executor) for `settings`.
pub(crate) fn build_tooling(settings: &Settings) -> (Arc<ToolRegistry>, Arc<ToolExecutor>) {
    let gateway = Arc::new(UreqGateway);
    let client = Arc::new(ScenarioClient::new(
        settings.url_resolver(),
        gateway.clone(),
        &settings.client,
    ));
    let registry = Arc::new(ToolRegistry::new(client, settings.peers.clone()));
    let executor = Arc::new(ToolExecutor::with_timeout(
        gateway,
        settings.client.tool_execution_timeout,
    ));
    (registry, executor)
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/tools", get(handle_list_tools))
        .route("/api/v1/tools/scenarios", get(handle_list_scenarios))
        .route("/api/v1/tools/refresh", post(handle_refresh))
        .route("/api/v1/chats/{chat_id}/tool-calls", post(handle_tool_call))
        .route("/api/v1/scenarios/states", get(handle_list_states))
        .route(
            "/api/v1/scenarios/{scenario}/state",
            get(handle_load_state)
                .put(handle_save_state)
                .delete(handle_clear_state),
        )
        .route(
            "/api/v1/scenarios/{scenario}/state/check",
            post(handle_check_staleness),
        )
        .route(
            "/api/v1/scenarios/{scenario}/state/logs/{service}",
            get(handle_get_logs),
        )
        .route(
            "/api/v1/scenarios/{scenario}/state/invalidate",
            post(handle_invalidate),
        )
        .route(
            "/api/v1/scenarios/{scenario}/state/stages/{stage}/validate",
            post(handle_mark_stage_valid),
        )
        .fallback(handle_not_found)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Open the state store, bind peer tools and serve until Ctrl+C.
pub async fn start_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(FileStateStore::open(&settings.data_dir).await?);
    info!(dir = %store.state_dir().display(), "state store opened");

    let (registry, executor) = build_tooling(&settings);
    let (refreshed, synced) = tools::refresh_and_sync(&registry, &executor).await;
    info!(
        peers = settings.peers.len(),
        available = refreshed.available.len(),
        tools = refreshed.tool_count,
        handlers = synced.registered.len(),
        "tool fabric ready"
    );

    let state = Arc::new(AppState::new(
        settings.scenario.clone(),
        StateService::new(store.clone()),
        registry,
        executor,
    ));

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(scenario = %settings.scenario, "fabric listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await?;
    info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
