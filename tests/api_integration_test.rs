//! Integration tests for the HTTP command plane.
//! Exercises the action envelope, error-code surface, namespace split
//! between the unified and browser-service ports, and the action log.

use axum::http::StatusCode;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use webauto_lib::api::{browser_service_router, unified_router, ApiState};
use webauto_lib::config::AppConfig;
use webauto_lib::state::AppState;

fn make_state(dir: &TempDir) -> ApiState {
    let mut config = AppConfig::default();
    config.chrome_path = dir.path().join("no-such-chrome");
    config.profiles_root = Some(dir.path().join("profiles"));
    config.container_library = Some(dir.path().join("containers"));
    config.download_root = Some(dir.path().join("download"));
    Arc::new(AppState::new(config))
}

fn action_body(action: &str, payload: serde_json::Value) -> axum::body::Body {
    axum::body::Body::from(
        serde_json::json!({ "action": action, "payload": payload }).to_string(),
    )
}

async fn post_action(
    router: axum::Router,
    path: &str,
    action: &str,
    payload: serde_json::Value,
) -> serde_json::Value {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(action_body(action, payload))
        .unwrap();
    let res = router.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unified_health() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let req = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_browser_service_health() {
    let dir = TempDir::new().unwrap();
    let app = browser_service_router(make_state(&dir));
    let req = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Envelope & error surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_action_is_business_error_not_http_error() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(app, "/v1/controller/action", "nope:verb", serde_json::json!({})).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    assert!(json["error"]["message"].as_str().unwrap().contains("nope:verb"));
}

#[tokio::test]
async fn test_session_list_empty() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(app, "/v1/controller/action", "session:list", serde_json::json!({})).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"], serde_json::json!([]));
}

#[tokio::test]
async fn test_browser_goto_without_session() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(
        app,
        "/v1/controller/action",
        "browser:goto",
        serde_json::json!({"profileId": "xhs_fresh", "url": "https://www.xiaohongshu.com/explore"}),
    )
    .await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_session_create_rejects_invalid_profile_id() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(
        app,
        "/v1/controller/action",
        "session:create",
        serde_json::json!({"profileId": "BadName"}),
    )
    .await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_session_create_without_chrome_reports_launch_failed() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(
        app,
        "/v1/controller/action",
        "session:create",
        serde_json::json!({"profileId": "xiaohongshu_fresh"}),
    )
    .await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "BROWSER_LAUNCH_FAILED");
}

#[tokio::test]
async fn test_malformed_payload_is_validation_error() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    // Missing required `url`.
    let json = post_action(
        app,
        "/v1/controller/action",
        "browser:goto",
        serde_json::json!({"profileId": "xhs_fresh"}),
    )
    .await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
}

// ---------------------------------------------------------------------------
// Browser-service port namespace split
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_command_port_accepts_raw_verbs() {
    let dir = TempDir::new().unwrap();
    let app = browser_service_router(make_state(&dir));
    let json = post_action(app, "/command", "session:list", serde_json::json!({})).await;
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn test_command_port_rejects_semantic_actions() {
    let dir = TempDir::new().unwrap();
    let app = browser_service_router(make_state(&dir));
    let json = post_action(
        app,
        "/command",
        "container:operation",
        serde_json::json!({
            "profileId": "xhs_fresh",
            "container": "xiaohongshu_search.search_result_item",
            "operationId": "click",
        }),
    )
    .await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("browser-service port"));
}

// ---------------------------------------------------------------------------
// System actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_system_display_reports_work_area() {
    let dir = TempDir::new().unwrap();
    let app = unified_router(make_state(&dir));
    let json = post_action(app, "/v1/controller/action", "system:display", serde_json::json!({})).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["workArea"]["width"], 1920);
    assert_eq!(json["data"]["workArea"]["height"], 1080);
}

#[tokio::test]
async fn test_input_mode_roundtrip() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    let json = post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "system:input-mode:get",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(json["data"]["mode"], "system");

    let json = post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "system:input-mode:set",
        serde_json::json!({"mode": "dom"}),
    )
    .await;
    assert_eq!(json["success"], true);

    let json = post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "system:input-mode:set",
        serde_json::json!({"mode": "telepathy"}),
    )
    .await;
    assert_eq!(json["success"], false);
}

// ---------------------------------------------------------------------------
// Container registry over the API
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_containers_reload_picks_up_library() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    let lib_dir = dir.path().join("containers");
    std::fs::create_dir_all(&lib_dir).unwrap();
    std::fs::write(
        lib_dir.join("xiaohongshu_search.json"),
        serde_json::json!({
            "id": "xiaohongshu_search",
            "urlPatterns": ["xiaohongshu\\.com/search_result"],
            "selectors": [{"variant": "primary", "css": "#global"}],
            "children": [{
                "id": "search_result_item",
                "selectors": [{"variant": "primary", "css": "section.note-item"}],
                "operations": ["click", "extract"]
            }]
        })
        .to_string(),
    )
    .unwrap();

    let json = post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "containers:reload",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["containers"], 2);

    assert!(state
        .registry()
        .get("xiaohongshu_search.search_result_item")
        .is_some());
}

#[tokio::test]
async fn test_containers_reload_rejects_invalid_library() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    let lib_dir = dir.path().join("containers");
    std::fs::create_dir_all(&lib_dir).unwrap();
    // Root with no urlPatterns is invalid.
    std::fs::write(
        lib_dir.join("bad.json"),
        serde_json::json!({
            "id": "xiaohongshu_bad",
            "selectors": [{"variant": "primary", "css": "#x"}]
        })
        .to_string(),
    )
    .unwrap();

    let json = post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "containers:reload",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(json["success"], false);
    // The previous (empty) registry stays in place on a failed reload.
    assert_eq!(state.registry().len(), 0);
}

// ---------------------------------------------------------------------------
// Action log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_action_log_records_calls() {
    let dir = TempDir::new().unwrap();
    let state = make_state(&dir);

    post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "session:list",
        serde_json::json!({}),
    )
    .await;
    post_action(
        unified_router(Arc::clone(&state)),
        "/v1/controller/action",
        "browser:goto",
        serde_json::json!({"profileId": "xhs_fresh", "url": "https://example.com"}),
    )
    .await;

    let req = axum::http::Request::builder()
        .uri("/v1/controller/actions?limit=10")
        .body(axum::body::Body::empty())
        .unwrap();
    let res = unified_router(Arc::clone(&state)).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.len(), 2);
    // Newest first.
    assert_eq!(entries[0]["action"], "browser:goto");
    assert_eq!(entries[0]["success"], false);
    assert_eq!(entries[0]["profile_id"], "xhs_fresh");
    assert_eq!(entries[1]["action"], "session:list");
    assert_eq!(entries[1]["success"], true);
}
