//! CDP client over a raw WebSocket.
//!
//! One client is attached to one page target at a time. Commands are
//! correlated by id through a oneshot map; CDP events fan out to one-shot
//! subscribers (navigation waits) and to a broadcast channel consumed by
//! the session-event WebSocket.

use crate::cookies::Cookie;
use crate::error::{Result, WebautoError};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// A CDP event forwarded to the session-event plane.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: serde_json::Value,
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    WsMessage,
>;

pub struct CdpClient {
    ws_tx: Option<Arc<Mutex<WsSink>>>,
    /// Command id → response waiter
    responses: Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>,
    /// CDP event method → one-shot waiters
    waiters: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<serde_json::Value>>>>>,
    /// All CDP events, for the session-event WebSocket. Lossy for slow readers.
    events: broadcast::Sender<CdpEvent>,
    profile_id: String,
    current_url: Arc<Mutex<String>>,
    msg_id: Arc<Mutex<u64>>,
    cdp_port: u16,
    /// Target id of the page this client is attached to.
    attached_target: Option<String>,
}

impl CdpClient {
    /// Attach to a running Chrome by CDP port. The browser must already be
    /// listening with `--remote-debugging-port={cdp_port}`.
    pub async fn attach(profile_id: String, cdp_port: u16) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        let mut client = Self {
            ws_tx: None,
            responses: Arc::new(Mutex::new(HashMap::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            events,
            profile_id,
            current_url: Arc::new(Mutex::new(String::new())),
            msg_id: Arc::new(Mutex::new(1)),
            cdp_port,
            attached_target: None,
        };
        client.connect_first_page().await?;
        Ok(client)
    }

    pub fn cdp_port(&self) -> u16 {
        self.cdp_port
    }

    pub fn is_connected(&self) -> bool {
        self.ws_tx.is_some()
    }

    pub fn attached_target(&self) -> Option<&str> {
        self.attached_target.as_deref()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Poll `/json/list` until a page target shows up, then connect.
    async fn connect_first_page(&mut self) -> Result<()> {
        let mut retries = 0u32;
        const MAX_RETRIES: u32 = 30;
        let mut last_error = String::new();

        while retries < MAX_RETRIES {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

            match self.list_targets().await {
                Ok(targets) => {
                    if let Some(target) = targets.first() {
                        let id = target.target_id.clone();
                        return self.attach_target(&id).await;
                    }
                    last_error = "No page target found".to_string();
                }
                Err(e) => last_error = e.to_string(),
            }

            retries += 1;
            tracing::debug!("CDP connect retry {}/{}: {}", retries, MAX_RETRIES, last_error);
        }

        Err(WebautoError::BrowserLaunchFailed(format!(
            "No CDP endpoint on port {} after {} retries: {}",
            self.cdp_port, MAX_RETRIES, last_error
        )))
    }

    /// Page targets in browser order, via the DevTools HTTP endpoint.
    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        let url = format!("http://127.0.0.1:{}/json/list", self.cdp_port);
        let response = reqwest::get(&url)
            .await
            .map_err(|e| WebautoError::Cdp(format!("target list: {}", e)))?;
        if !response.status().is_success() {
            return Err(WebautoError::Cdp(format!(
                "target list: HTTP {}",
                response.status()
            )));
        }
        let raw: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| WebautoError::Cdp(format!("target list: {}", e)))?;
        Ok(raw
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
            .filter_map(|t| {
                Some(TargetInfo {
                    target_id: t.get("id")?.as_str()?.to_string(),
                    url: t.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    title: t
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    ws_url: t
                        .get("webSocketDebuggerUrl")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                })
            })
            .collect())
    }

    /// Open a new page target (does not attach to it).
    pub async fn create_target(&self, url: &str) -> Result<TargetInfo> {
        let client = reqwest::Client::new();
        let endpoint = format!(
            "http://127.0.0.1:{}/json/new?{}",
            self.cdp_port,
            urlencode(url)
        );
        let response = client
            .put(&endpoint)
            .send()
            .await
            .map_err(|e| WebautoError::Cdp(format!("new target: {}", e)))?;
        let t: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WebautoError::Cdp(format!("new target: {}", e)))?;
        Ok(TargetInfo {
            target_id: t
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| WebautoError::Cdp("new target: no id".to_string()))?
                .to_string(),
            url: t.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            title: String::new(),
            ws_url: t
                .get("webSocketDebuggerUrl")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }

    /// Bring a target to the foreground.
    pub async fn activate_target(&self, target_id: &str) -> Result<()> {
        let url = format!(
            "http://127.0.0.1:{}/json/activate/{}",
            self.cdp_port, target_id
        );
        reqwest::get(&url)
            .await
            .map_err(|e| WebautoError::Cdp(format!("activate target: {}", e)))?;
        Ok(())
    }

    pub async fn close_target(&self, target_id: &str) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/json/close/{}", self.cdp_port, target_id);
        reqwest::get(&url)
            .await
            .map_err(|e| WebautoError::Cdp(format!("close target: {}", e)))?;
        Ok(())
    }

    /// Attach the command channel to a page target, replacing any prior
    /// attachment. Enables the Page/Runtime/Network domains.
    pub async fn attach_target(&mut self, target_id: &str) -> Result<()> {
        let targets = self.list_targets().await?;
        let target = targets
            .iter()
            .find(|t| t.target_id == target_id)
            .ok_or_else(|| WebautoError::Cdp(format!("no such target: {}", target_id)))?;
        let ws_url = target
            .ws_url
            .clone()
            .ok_or_else(|| WebautoError::Cdp("target has no webSocketDebuggerUrl".to_string()))?;

        tracing::info!("Connecting to CDP WebSocket: {}", ws_url);
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| WebautoError::Cdp(format!("WebSocket connect: {}", e)))?;

        let (tx, mut rx) = StreamExt::split(ws_stream);
        self.ws_tx = Some(Arc::new(Mutex::new(tx)));
        self.attached_target = Some(target_id.to_string());
        *self.current_url.lock().await = target.url.clone();

        let responses = Arc::clone(&self.responses);
        let waiters = Arc::clone(&self.waiters);
        let events = self.events.clone();
        let current_url = Arc::clone(&self.current_url);
        tokio::spawn(async move {
            while let Some(msg) = StreamExt::next(&mut rx).await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = json.get("id").and_then(|i| i.as_u64()) {
                            if let Some(sender) = responses.lock().await.remove(&id) {
                                let _ = sender.send(json);
                            }
                        } else if let Some(method) = json.get("method").and_then(|m| m.as_str()) {
                            let params = json
                                .get("params")
                                .cloned()
                                .unwrap_or(serde_json::Value::Null);

                            if method == "Page.frameNavigated" {
                                // Track top-frame navigations only.
                                if params
                                    .get("frame")
                                    .and_then(|f| f.get("parentId"))
                                    .is_none()
                                {
                                    if let Some(url) = params
                                        .get("frame")
                                        .and_then(|f| f.get("url"))
                                        .and_then(|v| v.as_str())
                                    {
                                        *current_url.lock().await = url.to_string();
                                    }
                                }
                            }

                            let _ = events.send(CdpEvent {
                                method: method.to_string(),
                                params: params.clone(),
                            });

                            let mut map = waiters.lock().await;
                            if let Some(senders) = map.remove(method) {
                                for sender in senders {
                                    let _ = sender.send(params.clone());
                                }
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::debug!("CDP WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("CDP WebSocket error: {:?}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        self.send_command("Page.enable", json!({})).await?;
        self.send_command("Runtime.enable", json!({})).await?;
        self.send_command("Network.enable", json!({})).await?;
        tracing::info!("CDP attached for profile {}", self.profile_id);
        Ok(())
    }

    /// Drop the command channel. The browser process is left alone.
    pub async fn detach(&mut self) {
        if let Some(tx) = self.ws_tx.take() {
            let _ = tx.lock().await.close().await;
        }
        self.attached_target = None;
    }

    /// Send a CDP command and wait for its response (default timeout).
    pub async fn send_command(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.send_command_timeout(method, params, DEFAULT_COMMAND_TIMEOUT_MS)
            .await
    }

    /// Send a CDP command with an explicit timeout. On expiry the waiter is
    /// dropped and the page stays usable.
    pub async fn send_command_timeout(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<serde_json::Value> {
        let tx = self
            .ws_tx
            .as_ref()
            .ok_or_else(|| WebautoError::Cdp("WebSocket not connected".to_string()))?;

        let (id, rx) = {
            let mut msg_id = self.msg_id.lock().await;
            let id = *msg_id;
            *msg_id += 1;

            let (tx, rx) = oneshot::channel();
            self.responses.lock().await.insert(id, tx);
            (id, rx)
        };

        let command = json!({ "id": id, "method": method, "params": params });

        {
            let mut guard = tx.lock().await;
            guard
                .send(WsMessage::Text(command.to_string()))
                .await
                .map_err(|e| WebautoError::Cdp(format!("send: {}", e)))?;
        }

        match tokio::time::timeout(tokio::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => {
                if let Some(err) = response.get("error") {
                    return Err(WebautoError::Cdp(format!("{}: {}", method, err)));
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(WebautoError::Cdp("response channel closed".to_string())),
            Err(_) => {
                self.responses.lock().await.remove(&id);
                Err(WebautoError::ActionTimeout {
                    action: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Register a one-shot waiter for a CDP event. Must be called BEFORE
    /// triggering the action that fires the event.
    pub async fn wait_event(&self, method: &str) -> oneshot::Receiver<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    // ── Navigation ─────────────────────────────────────────────────

    /// Navigate the attached page, waiting for `Page.loadEventFired`.
    /// A load that outlives the timeout is logged, not failed: SPAs often
    /// settle without firing load.
    pub async fn navigate(&self, url: &str, timeout_ms: u64) -> Result<()> {
        let rx = self.wait_event("Page.loadEventFired").await;

        self.send_command("Page.navigate", json!({ "url": url }))
            .await?;
        *self.current_url.lock().await = url.to_string();

        match tokio::time::timeout(tokio::time::Duration::from_millis(timeout_ms), rx).await {
            Ok(_) => tracing::debug!("Navigation complete: {}", url),
            Err(_) => tracing::warn!("Navigation timeout ({}ms): {}", timeout_ms, url),
        }
        tracing::info!("Navigated to: {}", url);
        Ok(())
    }

    /// Current URL as the page reports it.
    pub async fn url(&self) -> Result<String> {
        match self
            .evaluate("window.location.href", DEFAULT_COMMAND_TIMEOUT_MS)
            .await
        {
            Ok(serde_json::Value::String(url)) => {
                *self.current_url.lock().await = url.clone();
                Ok(url)
            }
            _ => Ok(self.current_url.lock().await.clone()),
        }
    }

    pub async fn title(&self) -> Result<String> {
        match self
            .evaluate("document.title", DEFAULT_COMMAND_TIMEOUT_MS)
            .await?
        {
            serde_json::Value::String(t) => Ok(t),
            _ => Ok(String::new()),
        }
    }

    // ── Evaluate ───────────────────────────────────────────────────

    /// Evaluate an expression and return its JSON projection. Functions and
    /// DOM nodes never cross this boundary: `returnByValue` forces plain
    /// data, and anything non-serializable comes back as null.
    pub async fn evaluate(&self, expression: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        let result = self
            .send_command_timeout(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
                timeout_ms,
            )
            .await?;

        if let Some(exception) = result
            .get("result")
            .and_then(|r| r.get("exceptionDetails"))
        {
            let msg = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| exception.get("text").and_then(|t| t.as_str()))
                .unwrap_or("JS evaluation error");
            return Err(WebautoError::Cdp(msg.to_string()));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("result"))
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    // ── Input: mouse ───────────────────────────────────────────────

    /// Dispatch one OS-level click at viewport coordinates: move, press,
    /// release. `clicks` > 1 produces double/triple clicks.
    pub async fn mouse_click(&self, x: f64, y: f64, clicks: u32) -> Result<()> {
        self.send_command(
            "Input.dispatchMouseEvent",
            json!({"type": "mouseMoved", "x": x, "y": y, "button": "none", "clickCount": 0}),
        )
        .await?;
        for n in 1..=clicks.max(1) {
            self.send_command(
                "Input.dispatchMouseEvent",
                json!({"type": "mousePressed", "x": x, "y": y, "button": "left", "clickCount": n}),
            )
            .await?;
            self.send_command(
                "Input.dispatchMouseEvent",
                json!({"type": "mouseReleased", "x": x, "y": y, "button": "left", "clickCount": n}),
            )
            .await?;
        }
        tracing::debug!("Clicked at ({:.1}, {:.1}) x{}", x, y, clicks);
        Ok(())
    }

    /// Wheel scroll at a viewport point.
    pub async fn mouse_wheel(&self, x: f64, y: f64, delta_x: f64, delta_y: f64) -> Result<()> {
        self.send_command(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": x, "y": y,
                "deltaX": delta_x, "deltaY": delta_y,
                "button": "none", "clickCount": 0
            }),
        )
        .await?;
        Ok(())
    }

    // ── Input: keyboard ────────────────────────────────────────────

    /// Press a key, with modifier combos like "Ctrl+A" or "Shift+Enter".
    pub async fn press_key(&self, key: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('+').collect();
        let (modifiers, base_key) = if parts.len() > 1 {
            let mut mask: u64 = 0;
            for m in &parts[..parts.len() - 1] {
                mask |= match *m {
                    "Ctrl" | "Control" => 2,
                    "Alt" => 1,
                    "Shift" => 8,
                    "Meta" | "Cmd" | "Command" => 4,
                    _ => 0,
                };
            }
            (mask, parts[parts.len() - 1])
        } else {
            (0, key)
        };

        let key_code = windows_virtual_key(base_key);

        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyDown",
                "key": base_key,
                "code": base_key,
                "windowsVirtualKeyCode": key_code,
                "modifiers": modifiers
            }),
        )
        .await?;

        // Printable characters without Ctrl/Alt/Meta also need a char event
        // so rich-text editors receive input.
        let is_printable = base_key.chars().count() == 1 && modifiers & (2 | 1 | 4) == 0;
        if is_printable {
            self.send_command(
                "Input.dispatchKeyEvent",
                json!({
                    "type": "char",
                    "key": base_key,
                    "text": base_key,
                    "modifiers": modifiers
                }),
            )
            .await?;
        }

        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": base_key,
                "code": base_key,
                "windowsVirtualKeyCode": key_code,
                "modifiers": modifiers
            }),
        )
        .await?;

        tracing::debug!("Pressed key: {}", key);
        Ok(())
    }

    /// Type text as a keystroke stream into whatever has focus. `delay_ms`
    /// spaces the keystrokes; `submit` presses Enter afterwards.
    pub async fn type_text(&self, text: &str, delay_ms: u64, submit: bool) -> Result<()> {
        for ch in text.chars() {
            let ch_str = ch.to_string();
            self.send_command(
                "Input.dispatchKeyEvent",
                json!({"type": "keyDown", "key": ch_str, "text": ch_str}),
            )
            .await?;
            self.send_command(
                "Input.dispatchKeyEvent",
                json!({"type": "char", "key": ch_str, "text": ch_str}),
            )
            .await?;
            self.send_command(
                "Input.dispatchKeyEvent",
                json!({"type": "keyUp", "key": ch_str, "text": ch_str}),
            )
            .await?;

            if delay_ms > 0 {
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }

        if submit {
            self.press_key("Enter").await?;
        }

        tracing::debug!("Typed {} chars (submit={})", text.chars().count(), submit);
        Ok(())
    }

    // ── Viewport / screenshot ──────────────────────────────────────

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.send_command(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false
            }),
        )
        .await?;
        tracing::debug!("Viewport set to {}x{}", width, height);
        Ok(())
    }

    /// Base64 PNG of the attached page.
    pub async fn screenshot(&self, full_page: bool) -> Result<String> {
        let mut params = json!({ "format": "png" });

        if full_page {
            let metrics = self.send_command("Page.getLayoutMetrics", json!({})).await?;
            let size = metrics
                .get("result")
                .and_then(|r| r.get("cssContentSize"))
                .cloned()
                .unwrap_or_default();
            let width = size.get("width").and_then(|v| v.as_f64()).unwrap_or(1280.0);
            let height = size.get("height").and_then(|v| v.as_f64()).unwrap_or(800.0);
            params["captureBeyondViewport"] = serde_json::Value::Bool(true);
            params["clip"] = json!({
                "x": 0, "y": 0, "width": width, "height": height, "scale": 1
            });
        }

        let result = self.send_command("Page.captureScreenshot", params).await?;
        result
            .get("result")
            .and_then(|r| r.get("data"))
            .and_then(|d| d.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| WebautoError::Cdp("screenshot: no data".to_string()))
    }

    // ── Cookies ────────────────────────────────────────────────────

    /// All cookies of the browser (not just the current page).
    pub async fn cookies(&self) -> Result<Vec<Cookie>> {
        let result = self.send_command("Storage.getCookies", json!({})).await?;
        let cookies = result
            .get("result")
            .and_then(|r| r.get("cookies"))
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        Ok(serde_json::from_value(cookies)?)
    }

    pub async fn add_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.send_command(
            "Network.setCookies",
            json!({ "cookies": serde_json::to_value(cookies)? }),
        )
        .await?;
        tracing::info!("Restored {} cookies for {}", cookies.len(), self.profile_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub ws_url: Option<String>,
}

fn windows_virtual_key(key: &str) -> i64 {
    match key {
        "Enter" => 13,
        "Tab" => 9,
        "Escape" => 27,
        "Backspace" => 8,
        "Delete" => 46,
        "ArrowUp" => 38,
        "ArrowDown" => 40,
        "ArrowLeft" => 37,
        "ArrowRight" => 39,
        "Home" => 36,
        "End" => 35,
        "PageUp" => 33,
        "PageDown" => 34,
        _ => key
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase() as i64)
            .unwrap_or(0),
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
