//! Single source of truth for `profile_id → BrowserSession`.
//!
//! Profile lock and browser process are acquired together and released
//! together on every exit path (stop, crash, startup reconnect failure).

use crate::config::schema::AppConfig;
use crate::config::validation::validate_profile_id;
use crate::cookies::{Autosaver, CookieStore};
use crate::error::{Result, WebautoError};
use crate::profile::lock;
use crate::session::browser::{BrowserSession, Viewport};
use crate::session::cdp::CdpClient;
use crate::session::events::SessionEvent;
use crate::session::launcher::{self, LaunchOptions};
use crate::session::persist;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::{broadcast, Mutex};

static NEXT_CDP_PORT: AtomicU16 = AtomicU16::new(9222);

/// Next CDP debug port: monotonic from 9222, wrapping at 65500, skipping
/// anything in `in_use`.
fn next_free_port(in_use: &HashSet<u16>) -> u16 {
    loop {
        let port = NEXT_CDP_PORT.fetch_add(1, Ordering::SeqCst);
        if port > 65500 {
            NEXT_CDP_PORT.store(9222, Ordering::SeqCst);
            continue;
        }
        if !in_use.contains(&port) {
            return port;
        }
    }
}

/// Per-create overrides on top of the configured browser defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CreateOptions {
    pub url: Option<String>,
    pub headless: Option<bool>,
    pub viewport: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub profile_id: String,
    pub owner_pid: u32,
    pub chrome_pid: Option<u32>,
    pub cdp_port: u16,
    pub started_at: u64,
    pub headless: bool,
    pub alive: bool,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<BrowserSession>>>,
    config: Arc<RwLock<AppConfig>>,
    cookie_store: Arc<CookieStore>,
    autosaver: Arc<Autosaver>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(config: Arc<RwLock<AppConfig>>, cookie_store: Arc<CookieStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            cookie_store,
            autosaver: Arc::new(Autosaver::new()),
            events,
        }
    }

    /// Lifecycle events: created / destroyed / crashed / page events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    fn profiles_root(&self) -> PathBuf {
        self.config.read().profiles_dir()
    }

    /// Allocate a CDP port for a new launch. Ports recorded in the
    /// persisted session map may belong to browsers that survived a
    /// service restart (including ones another service instance owns), so
    /// they are skipped rather than reused.
    async fn allocate_cdp_port(&self) -> u16 {
        let in_use: HashSet<u16> = match persist::load_sessions().await {
            Ok(map) => map.values().map(|e| e.cdp_port).collect(),
            Err(e) => {
                tracing::debug!("Persisted session map unreadable: {}", e);
                HashSet::new()
            }
        };
        next_free_port(&in_use)
    }

    /// Create a session for a profile, or return the live one (one session
    /// per profile; concurrent creates resolve to the same session).
    pub async fn create(
        &self,
        profile_id: &str,
        opts: CreateOptions,
    ) -> Result<Arc<BrowserSession>> {
        validate_profile_id(profile_id)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(profile_id) {
            if existing.is_alive() {
                tracing::info!("Session for {} already live, returning it", profile_id);
                return Ok(Arc::clone(existing));
            }
            // Dead browser still in the map: clean up before relaunching.
            if let Some(dead) = sessions.remove(profile_id) {
                self.teardown(&dead, true).await;
            }
        }

        let session = self.launch(profile_id, opts).await?;
        sessions.insert(profile_id.to_string(), Arc::clone(&session));
        let _ = self.events.send(SessionEvent::Created {
            profile_id: profile_id.to_string(),
        });
        Ok(session)
    }

    async fn launch(&self, profile_id: &str, opts: CreateOptions) -> Result<Arc<BrowserSession>> {
        let owner_pid = std::process::id();
        let profiles_root = self.profiles_root();
        lock::acquire(&profiles_root, profile_id, owner_pid)?;

        // From here on, any failure must release the lock.
        match self.launch_locked(profile_id, opts, owner_pid).await {
            Ok(session) => Ok(session),
            Err(e) => {
                let _ = lock::release(&profiles_root, profile_id);
                Err(e)
            }
        }
    }

    async fn launch_locked(
        &self,
        profile_id: &str,
        opts: CreateOptions,
        owner_pid: u32,
    ) -> Result<Arc<BrowserSession>> {
        let (chrome_path, mut launch_opts, work_area, autosave_interval) = {
            let config = self.config.read();
            let mut lo = LaunchOptions::from_defaults(&config.browser, opts.url.clone());
            if let Some(headless) = opts.headless {
                lo.headless = headless;
            }
            if let Some((w, h)) = opts.viewport {
                lo.viewport = (w, h);
            }
            (
                config.chrome_path.clone(),
                lo,
                (
                    config.browser.work_area_width,
                    config.browser.work_area_height,
                ),
                config.cookies.autosave_interval_ms,
            )
        };
        crate::config::validation::validate_chrome_path(&chrome_path)
            .map_err(|e| WebautoError::BrowserLaunchFailed(e.to_string()))?;

        // Viewport is clamped to the work area even at launch.
        launch_opts.viewport = (
            launch_opts.viewport.0.min(work_area.0),
            launch_opts.viewport.1.min(work_area.1),
        );

        let cdp_port = self.allocate_cdp_port().await;
        let user_data_dir = self.profiles_root().join(profile_id);
        let mut cmd =
            launcher::build_command(&chrome_path, &user_data_dir, cdp_port, &launch_opts);

        tracing::info!("Launching {} on CDP port {}", profile_id, cdp_port);
        let child = cmd
            .spawn()
            .map_err(|e| WebautoError::BrowserLaunchFailed(e.to_string()))?;
        let chrome_pid = child.id();

        let cdp = match CdpClient::attach(profile_id.to_string(), cdp_port).await {
            Ok(cdp) => cdp,
            Err(e) => {
                kill_pid(chrome_pid);
                return Err(WebautoError::BrowserLaunchFailed(e.to_string()));
            }
        };

        // Restore persisted cookies before the first real navigation.
        match self.cookie_store.load(profile_id).await {
            Ok(cookies) if !cookies.is_empty() => {
                if let Err(e) = cdp.add_cookies(&cookies).await {
                    tracing::warn!("Cookie restore failed for {}: {}", profile_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Cookie load failed for {}: {}", profile_id, e),
        }

        let session = Arc::new(BrowserSession::new(
            profile_id.to_string(),
            owner_pid,
            Some(chrome_pid),
            launch_opts.headless,
            Viewport {
                width: launch_opts.viewport.0,
                height: launch_opts.viewport.1,
            },
            work_area,
            cdp,
            self.events.clone(),
        ));

        self.start_autosave(profile_id, autosave_interval, &session);

        let entry = persist::SessionEntry {
            pid: chrome_pid,
            cdp_port,
            headless: launch_opts.headless,
        };
        let persist_id = profile_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = persist::save_session(&persist_id, entry).await {
                tracing::warn!("Failed to persist session for {}: {}", persist_id, e);
            }
        });

        tracing::info!("Session created: {} (pid {})", profile_id, chrome_pid);
        Ok(session)
    }

    /// Restart the autosave loop with an explicit cadence. The running
    /// task for the profile, if any, is replaced.
    pub async fn autosave_start(&self, profile_id: &str, interval_ms: Option<u64>) -> Result<u64> {
        let session = self.get(profile_id).await?;
        let interval = interval_ms
            .unwrap_or_else(|| self.config.read().cookies.autosave_interval_ms);
        self.start_autosave(profile_id, interval, &session);
        Ok(interval)
    }

    pub fn autosave_stop(&self, profile_id: &str) {
        self.autosaver.stop(profile_id);
    }

    pub fn autosave_running(&self, profile_id: &str) -> bool {
        self.autosaver.is_running(profile_id)
    }

    fn start_autosave(&self, profile_id: &str, interval_ms: u64, session: &Arc<BrowserSession>) {
        let fetch_session = Arc::clone(session);
        self.autosaver.start(
            profile_id,
            interval_ms,
            Arc::clone(&self.cookie_store),
            move || {
                let session = Arc::clone(&fetch_session);
                async move { session.cookies().await }
            },
        );
    }

    /// Stop a session: final stable-save attempt, close transport, kill the
    /// browser, release the lock.
    pub async fn destroy(&self, profile_id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(profile_id)
        }
        .ok_or_else(|| WebautoError::SessionNotFound(profile_id.to_string()))?;

        self.teardown(&session, false).await;
        let _ = self.events.send(SessionEvent::Destroyed {
            profile_id: profile_id.to_string(),
        });
        Ok(())
    }

    async fn teardown(&self, session: &Arc<BrowserSession>, crashed: bool) {
        let profile_id = session.profile_id().to_string();
        self.autosaver.stop(&profile_id);

        if !crashed {
            if let Ok(cookies) = session.cookies().await {
                if let Err(e) = self.cookie_store.save_if_stable(&profile_id, &cookies).await {
                    tracing::warn!("Final cookie save failed for {}: {}", profile_id, e);
                }
            }
        }
        self.cookie_store.forget(&profile_id);

        session.detach().await;
        if let Some(pid) = session.chrome_pid() {
            if !crashed {
                kill_pid(pid);
            }
        }

        if let Err(e) = lock::release(&self.profiles_root(), &profile_id) {
            tracing::warn!("Lock release failed for {}: {}", profile_id, e);
        }

        let persist_id = profile_id.clone();
        tokio::spawn(async move {
            let _ = persist::remove_session(&persist_id).await;
        });

        tracing::info!("Session torn down: {} (crashed={})", profile_id, crashed);
    }

    pub async fn get(&self, profile_id: &str) -> Result<Arc<BrowserSession>> {
        self.sessions
            .lock()
            .await
            .get(profile_id)
            .cloned()
            .ok_or_else(|| WebautoError::SessionNotFound(profile_id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            out.push(SessionSummary {
                profile_id: session.profile_id().to_string(),
                owner_pid: session.owner_pid(),
                chrome_pid: session.chrome_pid(),
                cdp_port: session.cdp_port().await,
                started_at: session.started_at(),
                headless: session.headless(),
                alive: session.is_alive(),
            });
        }
        out
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop sessions whose browser died. Returns the affected profiles;
    /// each gets a `session:crashed` event and a released lock.
    pub async fn reap_dead(&self) -> Vec<String> {
        let dead: Vec<Arc<BrowserSession>> = {
            let mut sessions = self.sessions.lock().await;
            let dead_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_alive())
                .map(|(id, _)| id.clone())
                .collect();
            dead_ids
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect()
        };

        let mut reaped = Vec::with_capacity(dead.len());
        for session in dead {
            let profile_id = session.profile_id().to_string();
            self.teardown(&session, true).await;
            let _ = self.events.send(SessionEvent::Crashed {
                profile_id: profile_id.clone(),
            });
            reaped.push(profile_id);
        }
        reaped
    }

    /// Re-attach to browsers persisted by a previous service run. Dead
    /// entries are removed from the persisted map.
    pub async fn reconnect_persisted(&self) {
        let persisted = match persist::load_sessions().await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Failed to load persisted sessions: {}", e);
                return;
            }
        };

        for (profile_id, entry) in persisted {
            let probe = format!("http://127.0.0.1:{}/json/version", entry.cdp_port);
            let alive = matches!(reqwest::get(&probe).await, Ok(r) if r.status().is_success());
            if !alive {
                tracing::info!("Persisted session dead, removing: {}", profile_id);
                let _ = persist::remove_session(&profile_id).await;
                let _ = lock::release(&self.profiles_root(), &profile_id);
                continue;
            }

            match CdpClient::attach(profile_id.clone(), entry.cdp_port).await {
                Ok(cdp) => {
                    let (work_area, viewport, autosave_interval) = {
                        let config = self.config.read();
                        (
                            (
                                config.browser.work_area_width,
                                config.browser.work_area_height,
                            ),
                            Viewport {
                                width: config.browser.viewport_width,
                                height: config.browser.viewport_height,
                            },
                            config.cookies.autosave_interval_ms,
                        )
                    };
                    let session = Arc::new(BrowserSession::new(
                        profile_id.clone(),
                        std::process::id(),
                        Some(entry.pid),
                        entry.headless,
                        viewport,
                        work_area,
                        cdp,
                        self.events.clone(),
                    ));
                    self.start_autosave(&profile_id, autosave_interval, &session);
                    self.sessions
                        .lock()
                        .await
                        .insert(profile_id.clone(), session);
                    tracing::info!(
                        "Reconnected session: {} (pid {}, port {})",
                        profile_id,
                        entry.pid,
                        entry.cdp_port
                    );
                }
                Err(e) => {
                    tracing::warn!("Reconnect failed for {}: {}", profile_id, e);
                    let _ = persist::remove_session(&profile_id).await;
                }
            }
        }
    }

    /// Graceful shutdown of every session.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.destroy(&id).await {
                tracing::warn!("Destroy failed for {}: {}", id, e);
            }
        }
    }
}

fn kill_pid(pid: u32) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new(),
    );
    if let Some(process) = system.process(pid) {
        if process.kill() {
            tracing::info!("Killed browser process {}", pid);
        } else {
            tracing::warn!("Failed to kill browser process {}", pid);
        }
    }
}
