//! One live browser bound to one profile.
//!
//! All operations funnel through the session's CDP client behind a fair
//! `tokio::sync::Mutex`, so operations submitted in order apply in order
//! (the per-session FIFO guarantee). DOM-dispatched gestures are not
//! exposed here: clicks and keystrokes go through the CDP Input domain
//! only.

use crate::cookies::Cookie;
use crate::error::{Result, WebautoError};
use crate::session::cdp::{CdpClient, CdpEvent};
use crate::session::events::SessionEvent;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    pub index: usize,
    pub url: String,
    pub title: String,
    pub active: bool,
}

pub struct BrowserSession {
    profile_id: String,
    owner_pid: u32,
    chrome_pid: Option<u32>,
    started_at: u64,
    headless: bool,
    /// Clamp bound for set_viewport.
    work_area: (u32, u32),
    viewport: parking_lot::Mutex<Viewport>,
    /// FIFO operation gate + transport. Fair acquisition order is the
    /// serialization guarantee.
    cdp: Mutex<CdpClient>,
    /// Target ids in open order; indices are handed to callers.
    page_order: parking_lot::Mutex<Vec<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("profile_id", &self.profile_id)
            .field("owner_pid", &self.owner_pid)
            .field("chrome_pid", &self.chrome_pid)
            .field("started_at", &self.started_at)
            .field("headless", &self.headless)
            .finish()
    }
}

impl BrowserSession {
    pub(crate) fn new(
        profile_id: String,
        owner_pid: u32,
        chrome_pid: Option<u32>,
        headless: bool,
        viewport: Viewport,
        work_area: (u32, u32),
        cdp: CdpClient,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let initial_target = cdp.attached_target().map(|t| t.to_string());
        Self {
            profile_id,
            owner_pid,
            chrome_pid,
            started_at: chrono::Utc::now().timestamp_millis() as u64,
            headless,
            work_area,
            viewport: parking_lot::Mutex::new(viewport),
            cdp: Mutex::new(cdp),
            page_order: parking_lot::Mutex::new(initial_target.into_iter().collect()),
            events,
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn chrome_pid(&self) -> Option<u32> {
        self.chrome_pid
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn viewport(&self) -> Viewport {
        *self.viewport.lock()
    }

    pub async fn cdp_port(&self) -> u16 {
        self.cdp.lock().await.cdp_port()
    }

    /// Whether the browser process behind this session is still alive.
    pub fn is_alive(&self) -> bool {
        match self.chrome_pid {
            Some(pid) => crate::profile::lock::pid_alive(pid),
            // Re-attached session without an owned pid: trust the transport.
            None => true,
        }
    }

    /// CDP event stream of the attached page (navigation, load, dialogs).
    pub async fn subscribe_cdp(&self) -> broadcast::Receiver<CdpEvent> {
        self.cdp.lock().await.subscribe_events()
    }

    // ── Navigation & evaluation ────────────────────────────────────

    pub async fn goto(&self, url: &str, timeout_ms: u64) -> Result<()> {
        let cdp = self.cdp.lock().await;
        cdp.navigate(url, timeout_ms).await?;
        let _ = self.events.send(SessionEvent::Navigated {
            profile_id: self.profile_id.clone(),
            url: url.to_string(),
        });
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        self.cdp.lock().await.url().await
    }

    pub async fn title(&self) -> Result<String> {
        self.cdp.lock().await.title().await
    }

    /// Evaluate an expression in the active page. The result is always a
    /// JSON projection; the caller governs script safety.
    pub async fn evaluate(&self, script: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        self.cdp.lock().await.evaluate(script, timeout_ms).await
    }

    pub async fn screenshot(&self, full_page: bool) -> Result<String> {
        self.cdp.lock().await.screenshot(full_page).await
    }

    // ── Input ──────────────────────────────────────────────────────

    pub async fn press_key(&self, key: &str) -> Result<()> {
        self.cdp.lock().await.press_key(key).await
    }

    pub async fn type_text(&self, text: &str, delay_ms: u64, submit: bool) -> Result<()> {
        self.cdp.lock().await.type_text(text, delay_ms, submit).await
    }

    pub async fn mouse_click(&self, x: f64, y: f64, clicks: u32) -> Result<()> {
        self.cdp.lock().await.mouse_click(x, y, clicks).await
    }

    pub async fn mouse_wheel(&self, x: f64, y: f64, dx: f64, dy: f64) -> Result<()> {
        self.cdp.lock().await.mouse_wheel(x, y, dx, dy).await
    }

    // ── Viewport ───────────────────────────────────────────────────

    /// Resize the viewport, clamped to the OS work area. Zero is rejected.
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<Viewport> {
        if width == 0 || height == 0 {
            return Err(WebautoError::Validation(
                "Viewport dimensions must be positive".to_string(),
            ));
        }
        let clamped = Viewport {
            width: width.min(self.work_area.0),
            height: height.min(self.work_area.1),
        };
        self.cdp
            .lock()
            .await
            .set_viewport(clamped.width, clamped.height)
            .await?;
        *self.viewport.lock() = clamped;
        Ok(clamped)
    }

    // ── Pages ──────────────────────────────────────────────────────

    /// Pages in open order. New targets the browser opened on its own
    /// (window.open, target=_blank) are appended; vanished ones dropped.
    pub async fn page_list(&self) -> Result<Vec<PageInfo>> {
        let cdp = self.cdp.lock().await;
        let targets = cdp.list_targets().await?;
        let active = cdp.attached_target().map(|t| t.to_string());

        let mut order = self.page_order.lock();
        order.retain(|id| targets.iter().any(|t| &t.target_id == id));
        for t in &targets {
            if !order.contains(&t.target_id) {
                order.push(t.target_id.clone());
            }
        }

        Ok(order
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                targets.iter().find(|t| &t.target_id == id).map(|t| PageInfo {
                    index,
                    url: t.url.clone(),
                    title: t.title.clone(),
                    active: active.as_deref() == Some(id.as_str()),
                })
            })
            .collect())
    }

    /// Switch the active page. An out-of-range index leaves the active
    /// page unchanged.
    pub async fn page_switch(&self, index: usize) -> Result<()> {
        let target_id = self.target_at(index)?;
        let mut cdp = self.cdp.lock().await;
        cdp.activate_target(&target_id).await?;
        cdp.detach().await;
        cdp.attach_target(&target_id).await?;
        tracing::info!("Switched {} to page {}", self.profile_id, index);
        Ok(())
    }

    /// Open a new page and return its index. The active page is unchanged.
    pub async fn page_new(&self, url: Option<&str>) -> Result<usize> {
        let cdp = self.cdp.lock().await;
        let target = cdp.create_target(url.unwrap_or("about:blank")).await?;
        let index = {
            let mut order = self.page_order.lock();
            order.push(target.target_id);
            order.len() - 1
        };
        let _ = self.events.send(SessionEvent::PageOpened {
            profile_id: self.profile_id.clone(),
            index,
        });
        Ok(index)
    }

    /// Close a page by index. Closing the active page re-attaches to the
    /// first remaining one.
    pub async fn page_close(&self, index: usize) -> Result<()> {
        let target_id = self.target_at(index)?;
        let mut cdp = self.cdp.lock().await;
        let was_active = cdp.attached_target() == Some(target_id.as_str());
        cdp.close_target(&target_id).await?;
        self.page_order.lock().retain(|id| id != &target_id);

        if was_active {
            cdp.detach().await;
            let next = self.page_order.lock().first().cloned();
            if let Some(next) = next {
                cdp.attach_target(&next).await?;
            }
        }
        let _ = self.events.send(SessionEvent::PageClosed {
            profile_id: self.profile_id.clone(),
            index,
        });
        Ok(())
    }

    fn target_at(&self, index: usize) -> Result<String> {
        self.page_order
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| {
                WebautoError::SessionNotFound(format!(
                    "{} has no page at index {}",
                    self.profile_id, index
                ))
            })
    }

    // ── Cookies ────────────────────────────────────────────────────

    pub async fn cookies(&self) -> Result<Vec<Cookie>> {
        self.cdp.lock().await.cookies().await
    }

    pub async fn add_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        self.cdp.lock().await.add_cookies(cookies).await
    }

    /// Drop the CDP connection. Process teardown is the manager's job.
    pub(crate) async fn detach(&self) {
        self.cdp.lock().await.detach().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_serializes() {
        let v = Viewport {
            width: 1280,
            height: 800,
        };
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["width"], 1280);
    }
}
