use crate::api::action_log::ActionLog;
use crate::api::ws::{Broadcaster, BusFrame};
use crate::checkpoint::CheckpointDetector;
use crate::config::AppConfig;
use crate::container::ContainerRegistry;
use crate::cookies::CookieStore;
use crate::error::Result;
use crate::session::SessionManager;
use parking_lot::RwLock;
use std::sync::Arc;

/// Application global state
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub session_manager: Arc<SessionManager>,
    pub cookie_store: Arc<CookieStore>,
    /// Read-mostly; reloads swap the whole registry atomically.
    registry: RwLock<Arc<ContainerRegistry>>,
    detector: RwLock<Arc<CheckpointDetector>>,
    /// In-memory action log (last 2000 controller actions).
    pub action_log: Arc<ActionLog>,
    /// Observer event bus (lossy, replayed to late joiners).
    pub bus: Broadcaster,
    /// "system" (CDP Input domain) or "dom" (debug only).
    pub input_mode: RwLock<String>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let cookie_store = Arc::new(CookieStore::new(
            config.cookies_dir(),
            config.cookies.stability_min_delay_ms,
        ));
        let registry = Arc::new(
            ContainerRegistry::load_dir(&config.containers_dir()).unwrap_or_else(|e| {
                tracing::error!("Container library load failed: {}. Starting empty.", e);
                ContainerRegistry::empty()
            }),
        );
        let detector = Arc::new(CheckpointDetector::from_registry(&registry));
        let config = Arc::new(RwLock::new(config));
        let session_manager = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&cookie_store),
        ));
        Self {
            config,
            session_manager,
            cookie_store,
            registry: RwLock::new(registry),
            detector: RwLock::new(detector),
            action_log: Arc::new(ActionLog::new()),
            bus: Broadcaster::new(),
            input_mode: RwLock::new("system".to_string()),
        }
    }

    pub fn registry(&self) -> Arc<ContainerRegistry> {
        Arc::clone(&self.registry.read())
    }

    pub fn detector(&self) -> Arc<CheckpointDetector> {
        Arc::clone(&self.detector.read())
    }

    /// Re-read the container library and swap it in, with the detector
    /// probes derived from it. Returns the container count.
    pub fn reload_registry(&self) -> Result<usize> {
        let dir = self.config.read().containers_dir();
        let registry = Arc::new(ContainerRegistry::load_dir(&dir)?);
        let detector = Arc::new(CheckpointDetector::from_registry(&registry));
        let count = registry.len();
        *self.registry.write() = registry;
        *self.detector.write() = detector;
        tracing::info!("Container library reloaded: {} containers", count);
        Ok(count)
    }

    /// Broadcast a frame on the observer bus.
    pub fn broadcast(&self, frame_type: &str, data: serde_json::Value) {
        self.bus.broadcast(BusFrame::new(frame_type, data));
    }
}
