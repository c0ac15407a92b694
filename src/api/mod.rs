//! HTTP command plane + WebSocket push planes.
//!
//! Unified API (default :7701): `/v1/controller/action`, the action log,
//! `/health`, `/ws` (session events), `/bus` (observer bus).
//! Browser service (default :7704): `/command` with the raw
//! browser/session verbs, `/health`. Session events also get their own
//! WebSocket listener (default :8765) so thin clients can skip HTTP.

pub mod action_log;
pub mod dispatch;
pub mod envelope;
pub mod ws;

use crate::api::envelope::{ActionRequest, ActionResponse};
use crate::error::WebautoError;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub type ApiState = Arc<AppState>;

pub fn unified_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/controller/action", post(controller_action))
        .route(
            "/v1/controller/actions",
            get(get_action_log).delete(clear_action_log),
        )
        .route("/health", get(health))
        .route("/ws", get(ws::session_events_handler))
        .route("/bus", get(ws::bus_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn browser_service_router(state: ApiState) -> Router {
    Router::new()
        .route("/command", post(command_action))
        .route("/health", get(health))
        .with_state(state)
}

pub fn events_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(ws::session_events_handler))
        .route("/ws", get(ws::session_events_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn controller_action(
    State(state): State<ApiState>,
    Json(req): Json<ActionRequest>,
) -> Json<ActionResponse> {
    Json(run_action(&state, req).await)
}

/// `/command` exposes raw verbs only, so the unified layer can be bypassed
/// by tests without opening the semantic surface on this port.
async fn command_action(
    State(state): State<ApiState>,
    Json(req): Json<ActionRequest>,
) -> Json<ActionResponse> {
    if !dispatch::is_browser_service_action(&req.action) {
        let err = WebautoError::Validation(format!(
            "Action '{}' is not available on the browser-service port",
            req.action
        ));
        return Json(ActionResponse::err(&err));
    }
    Json(run_action(&state, req).await)
}

/// Execute, log, and broadcast one action.
async fn run_action(state: &ApiState, req: ActionRequest) -> ActionResponse {
    let started = std::time::Instant::now();
    let profile_id = dispatch::profile_of(&req.payload);

    let result = dispatch::dispatch(state, &req).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (response, success, error) = match result {
        Ok(data) => (ActionResponse::ok(data), true, None),
        Err(e) => {
            tracing::debug!("Action {} failed: {}", req.action, e);
            let resp = ActionResponse::err(&e);
            (resp, false, Some(e.to_string()))
        }
    };

    let entry = action_log::ActionEntry {
        id: uuid::Uuid::new_v4().to_string(),
        ts: chrono::Utc::now().timestamp_millis() as u64,
        profile_id: profile_id.clone(),
        action: req.action.clone(),
        duration_ms,
        success,
        error,
    };
    state.action_log.push(entry.clone());
    action_log::append_to_file(&entry);
    state.broadcast(
        "action",
        serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null),
    );

    response
}

async fn get_action_log(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<action_log::ActionEntry>> {
    let profile_id = params.get("profileId").map(String::as_str);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    Json(state.action_log.get_filtered(profile_id, limit))
}

async fn clear_action_log(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::http::StatusCode {
    state.action_log.clear(params.get("profileId").map(String::as_str));
    axum::http::StatusCode::NO_CONTENT
}

/// Bind and serve all three planes until the process exits.
pub async fn run_server(state: ApiState) -> anyhow::Result<()> {
    let (unified_port, browser_port, events_port) = {
        let config = state.config.read();
        (
            config.service.unified_port,
            config.service.browser_port,
            config.service.events_port,
        )
    };

    let unified = tokio::net::TcpListener::bind(("127.0.0.1", unified_port)).await?;
    let browser = tokio::net::TcpListener::bind(("127.0.0.1", browser_port)).await?;
    let events = tokio::net::TcpListener::bind(("127.0.0.1", events_port)).await?;
    tracing::info!(
        "Listening: unified API :{}, browser service :{}, session events :{}",
        unified_port,
        browser_port,
        events_port
    );

    let unified_srv = axum::serve(unified, unified_router(Arc::clone(&state)));
    let browser_srv = axum::serve(browser, browser_service_router(Arc::clone(&state)));
    let events_srv = axum::serve(events, events_router(Arc::clone(&state)));

    tokio::try_join!(
        async { unified_srv.await.map_err(anyhow::Error::from) },
        async { browser_srv.await.map_err(anyhow::Error::from) },
        async { events_srv.await.map_err(anyhow::Error::from) },
    )?;
    Ok(())
}
