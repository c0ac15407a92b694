//! Action dispatch: one table from `action` to (payload type, handler).

use crate::api::envelope::ActionRequest;
use crate::checkpoint::EnsureOptions;
use crate::container::matcher;
use crate::container::schema::OperationId;
use crate::error::{Result, WebautoError};
use crate::ops;
use crate::session::CreateOptions;
use crate::state::AppState;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_NAV_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_EVAL_TIMEOUT_MS: u64 = 10_000;

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePayload {
    profile_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewportPayload {
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreatePayload {
    profile_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headless: Option<bool>,
    #[serde(default)]
    viewport: Option<ViewportPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GotoPayload {
    profile_id: String,
    url: String,
    #[serde(default = "default_nav_timeout")]
    timeout_ms: u64,
}

fn default_nav_timeout() -> u64 {
    DEFAULT_NAV_TIMEOUT_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutePayload {
    profile_id: String,
    script: String,
    #[serde(default = "default_eval_timeout")]
    timeout_ms: u64,
}

fn default_eval_timeout() -> u64 {
    DEFAULT_EVAL_TIMEOUT_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotPayload {
    profile_id: String,
    #[serde(default)]
    full_page: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageIndexPayload {
    profile_id: String,
    index: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageNewPayload {
    profile_id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewportSetPayload {
    profile_id: String,
    width: u32,
    height: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyPayload {
    profile_id: String,
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypePayload {
    profile_id: String,
    text: String,
    #[serde(default = "default_type_delay")]
    delay_ms: u64,
    #[serde(default)]
    submit: bool,
}

fn default_type_delay() -> u64 {
    30
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MouseClickPayload {
    profile_id: String,
    x: f64,
    y: f64,
    #[serde(default = "default_clicks")]
    clicks: u32,
}

fn default_clicks() -> u32 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerOperationPayload {
    profile_id: String,
    container: String,
    operation_id: OperationId,
    #[serde(default)]
    config: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainersMatchPayload {
    profile_id: String,
    #[serde(default)]
    container: Option<String>,
    #[serde(default = "default_match_timeout")]
    timeout_ms: u64,
}

fn default_match_timeout() -> u64 {
    matcher::DEFAULT_MATCH_TIMEOUT_MS
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointEnsurePayload {
    profile_id: String,
    target: String,
    #[serde(default = "default_ensure_timeout")]
    timeout_ms: u64,
    #[serde(default)]
    allow_one_level_up_fallback: bool,
}

fn default_ensure_timeout() -> u64 {
    10_000
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookiesSavePayload {
    profile_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutosavePayload {
    profile_id: String,
    #[serde(default)]
    interval_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputModePayload {
    mode: String,
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| WebautoError::Validation(format!("Invalid payload: {}", e)))
}

/// Profile id of a request, for the action log. Best-effort.
pub fn profile_of(payload: &Value) -> String {
    payload
        .get("profileId")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute one action. The envelope's `timeout_ms` bounds the whole call;
/// expiry aborts the underlying browser call without tearing down the
/// session.
pub async fn dispatch(state: &Arc<AppState>, req: &ActionRequest) -> Result<Value> {
    match req.timeout_ms {
        Some(timeout_ms) => {
            match tokio::time::timeout(
                tokio::time::Duration::from_millis(timeout_ms),
                dispatch_inner(state, req),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(WebautoError::ActionTimeout {
                    action: req.action.clone(),
                    timeout_ms,
                }),
            }
        }
        None => dispatch_inner(state, req).await,
    }
}

async fn dispatch_inner(state: &Arc<AppState>, req: &ActionRequest) -> Result<Value> {
    let payload = &req.payload;
    match req.action.as_str() {
        // ── Sessions ──────────────────────────────────────────────
        "session:create" => {
            let p: SessionCreatePayload = parse(payload)?;
            let session = state
                .session_manager
                .create(
                    &p.profile_id,
                    CreateOptions {
                        url: p.url,
                        headless: p.headless,
                        viewport: p.viewport.map(|v| (v.width, v.height)),
                    },
                )
                .await?;
            Ok(json!({
                "profileId": session.profile_id(),
                "chromePid": session.chrome_pid(),
                "cdpPort": session.cdp_port().await,
                "startedAt": session.started_at(),
                "headless": session.headless(),
            }))
        }
        "session:stop" | "session:destroy" => {
            let p: ProfilePayload = parse(payload)?;
            state.session_manager.destroy(&p.profile_id).await?;
            Ok(json!({ "stopped": p.profile_id }))
        }
        "session:list" => {
            let sessions = state.session_manager.list().await;
            Ok(serde_json::to_value(sessions)?)
        }
        "session:health" => {
            let p: ProfilePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            Ok(json!({
                "profileId": p.profile_id,
                "alive": session.is_alive(),
                "url": session.url().await.ok(),
            }))
        }

        // ── Browser verbs ─────────────────────────────────────────
        "browser:goto" => {
            let p: GotoPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.goto(&p.url, p.timeout_ms).await?;
            Ok(json!({ "url": session.url().await? }))
        }
        "browser:execute" => {
            let p: ExecutePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let value = session.evaluate(&p.script, p.timeout_ms).await?;
            Ok(json!({ "result": value }))
        }
        "browser:screenshot" => {
            let p: ScreenshotPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let data = session.screenshot(p.full_page).await?;
            Ok(json!({ "format": "png", "base64": data }))
        }
        "browser:url" => {
            let p: ProfilePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            Ok(json!({ "url": session.url().await?, "title": session.title().await? }))
        }
        "browser:page:list" => {
            let p: ProfilePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            Ok(serde_json::to_value(session.page_list().await?)?)
        }
        "browser:page:switch" => {
            let p: PageIndexPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.page_switch(p.index).await?;
            Ok(json!({ "active": p.index }))
        }
        "browser:page:new" => {
            let p: PageNewPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let index = session.page_new(p.url.as_deref()).await?;
            Ok(json!({ "index": index }))
        }
        "browser:page:close" => {
            let p: PageIndexPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.page_close(p.index).await?;
            Ok(json!({ "closed": p.index }))
        }
        "browser:viewport:set" => {
            let p: ViewportSetPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let applied = session.set_viewport(p.width, p.height).await?;
            Ok(serde_json::to_value(applied)?)
        }

        // ── System input ──────────────────────────────────────────
        "keyboard:press" => {
            let p: KeyPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.press_key(&p.key).await?;
            Ok(json!({ "pressed": p.key }))
        }
        "keyboard:type" => {
            let p: TypePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            ops::type_text(
                &session,
                ops::TypeConfig {
                    text: p.text.clone(),
                    delay_ms: p.delay_ms,
                    submit: p.submit,
                },
            )
            .await?;
            Ok(json!({ "typed": p.text.chars().count() }))
        }
        "mouse:click" => {
            let p: MouseClickPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.mouse_click(p.x, p.y, p.clicks).await?;
            Ok(json!({ "x": p.x, "y": p.y, "clicks": p.clicks }))
        }

        // ── Containers ────────────────────────────────────────────
        "containers:match" => {
            let p: ContainersMatchPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let registry = state.registry();
            match &p.container {
                Some(container) => {
                    let results =
                        matcher::match_container(&session, &registry, container, p.timeout_ms)
                            .await?;
                    Ok(serde_json::to_value(results)?)
                }
                None => {
                    // Full sweep of the URL's containers; absent ones are
                    // simply omitted.
                    let url = session.url().await?;
                    let mut map = serde_json::Map::new();
                    let defs: Vec<_> = registry
                        .containers_for_url(&url)
                        .into_iter()
                        .cloned()
                        .collect();
                    for def in defs {
                        match matcher::match_in_scope(&session, &def, p.timeout_ms).await {
                            Ok(results) => {
                                map.insert(def.id.clone(), serde_json::to_value(results)?);
                            }
                            Err(WebautoError::ContainerNoMatch(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(Value::Object(map))
                }
            }
        }
        "container:operation" => {
            let mut p: ContainerOperationPayload = parse(payload)?;
            if p.config.is_null() {
                p.config = json!({});
            }
            let session = state.session_manager.get(&p.profile_id).await?;
            let registry = state.registry();
            let value = match p.operation_id {
                OperationId::Highlight => {
                    let cfg: ops::HighlightConfig = parse(&p.config)?;
                    let outcome = ops::highlight(&session, &registry, &p.container, cfg).await?;
                    state.broadcast(
                        "container:highlight",
                        json!({ "profileId": p.profile_id, "container": p.container }),
                    );
                    serde_json::to_value(outcome)?
                }
                OperationId::Extract => {
                    let cfg: ops::ExtractConfig = parse(&p.config)?;
                    serde_json::to_value(ops::extract(&session, &registry, &p.container, cfg).await?)?
                }
                OperationId::Click => {
                    let cfg: ops::ClickConfig = parse(&p.config)?;
                    serde_json::to_value(ops::click(&session, &registry, &p.container, cfg).await?)?
                }
                OperationId::Scroll => {
                    let cfg: ops::ScrollConfig = parse(&p.config)?;
                    serde_json::to_value(ops::scroll(&session, &registry, &p.container, cfg).await?)?
                }
                OperationId::Type => {
                    let cfg: ops::TypeConfig = parse(&p.config)?;
                    ops::type_text(&session, cfg).await?;
                    json!({ "ok": true })
                }
            };
            Ok(value)
        }
        "containers:reload" => {
            let count = state.reload_registry()?;
            Ok(json!({ "containers": count }))
        }

        // ── Checkpoints ───────────────────────────────────────────
        "checkpoint:detect" => {
            let p: ProfilePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let detection = state
                .detector()
                .detect(&session, &state.registry())
                .await?;
            Ok(serde_json::to_value(detection)?)
        }
        "checkpoint:ensure" => {
            let p: CheckpointEnsurePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let detection = state
                .detector()
                .ensure(
                    &session,
                    &state.registry(),
                    &p.target,
                    EnsureOptions {
                        timeout_ms: p.timeout_ms,
                        allow_one_level_up: p.allow_one_level_up_fallback,
                    },
                )
                .await?;
            Ok(serde_json::to_value(detection)?)
        }

        // ── Cookies ───────────────────────────────────────────────
        "cookies:get" => {
            let p: ProfilePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            Ok(serde_json::to_value(session.cookies().await?)?)
        }
        "cookies:add" => {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct AddCookiesPayload {
                profile_id: String,
                cookies: Vec<crate::cookies::Cookie>,
            }
            let p: AddCookiesPayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            session.add_cookies(&p.cookies).await?;
            Ok(json!({ "added": p.cookies.len() }))
        }
        "cookies:save" => {
            let p: CookiesSavePayload = parse(payload)?;
            let session = state.session_manager.get(&p.profile_id).await?;
            let cookies = session.cookies().await?;
            if p.force {
                state.cookie_store.force_save(&p.profile_id, &cookies).await?;
                Ok(json!({ "saved": true, "reason": "forced", "count": cookies.len() }))
            } else {
                let outcome = state
                    .cookie_store
                    .save_if_stable(&p.profile_id, &cookies)
                    .await?;
                Ok(json!({
                    "saved": outcome.saved,
                    "reason": outcome.reason,
                    "count": cookies.len(),
                }))
            }
        }

        "cookies:autosave:start" => {
            let p: AutosavePayload = parse(payload)?;
            let interval = state
                .session_manager
                .autosave_start(&p.profile_id, p.interval_ms)
                .await?;
            Ok(json!({ "running": true, "intervalMs": interval }))
        }
        "cookies:autosave:stop" => {
            let p: ProfilePayload = parse(payload)?;
            state.session_manager.autosave_stop(&p.profile_id);
            Ok(json!({ "running": false }))
        }

        // ── System ────────────────────────────────────────────────
        "system:display" => {
            let config = state.config.read();
            Ok(json!({
                "workArea": {
                    "width": config.browser.work_area_width,
                    "height": config.browser.work_area_height,
                },
                "defaultViewport": {
                    "width": config.browser.viewport_width,
                    "height": config.browser.viewport_height,
                },
            }))
        }
        "system:input-mode:get" => {
            Ok(json!({ "mode": state.input_mode.read().clone() }))
        }
        "system:input-mode:set" => {
            let p: InputModePayload = parse(payload)?;
            if p.mode != "system" && p.mode != "dom" {
                return Err(WebautoError::Validation(format!(
                    "Unknown input mode '{}'",
                    p.mode
                )));
            }
            if p.mode == "dom" {
                tracing::warn!("Input mode set to 'dom'; workflow gestures remain system-level");
            }
            *state.input_mode.write() = p.mode.clone();
            Ok(json!({ "mode": p.mode }))
        }

        other => Err(WebautoError::Validation(format!(
            "Unknown action: {}",
            other
        ))),
    }
}

/// The browser-service `/command` plane accepts only the raw
/// browser/session verbs; semantic layers stay on the unified port.
pub fn is_browser_service_action(action: &str) -> bool {
    action.starts_with("session:")
        || action.starts_with("browser:")
        || action.starts_with("keyboard:")
        || action.starts_with("mouse:")
        || action.starts_with("cookies:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_of() {
        assert_eq!(
            profile_of(&json!({"profileId": "xhs_fresh", "url": "x"})),
            "xhs_fresh"
        );
        assert_eq!(profile_of(&json!({})), "");
    }

    #[test]
    fn test_browser_service_namespace_filter() {
        assert!(is_browser_service_action("browser:goto"));
        assert!(is_browser_service_action("session:create"));
        assert!(is_browser_service_action("mouse:click"));
        assert!(!is_browser_service_action("container:operation"));
        assert!(!is_browser_service_action("checkpoint:ensure"));
    }

    #[test]
    fn test_payload_validation_rejects_wrong_shape() {
        let bad: std::result::Result<GotoPayload, _> =
            serde_json::from_value(json!({"profileId": "xhs_fresh"}));
        assert!(bad.is_err());

        let good: GotoPayload = serde_json::from_value(json!({
            "profileId": "xhs_fresh",
            "url": "https://www.xiaohongshu.com/explore"
        }))
        .unwrap();
        assert_eq!(good.timeout_ms, DEFAULT_NAV_TIMEOUT_MS);
    }
}
