use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Chrome executable path
    pub chrome_path: PathBuf,

    /// Network and port layout
    #[serde(default)]
    pub service: ServiceConfig,

    /// Per-profile launch defaults
    #[serde(default)]
    pub browser: BrowserDefaults,

    /// Cookie persistence behaviour
    #[serde(default)]
    pub cookies: CookieConfig,

    /// Browser user-data root (defaults to ~/.webauto/profiles)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles_root: Option<PathBuf>,

    /// Container library location (defaults to ~/.webauto/containers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_library: Option<PathBuf>,

    /// Artifact output root (defaults to ~/.webauto/download)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_root: Option<PathBuf>,

    /// Debug artifact switches
    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chrome_path: Self::default_chrome_path(),
            service: ServiceConfig::default(),
            browser: BrowserDefaults::default(),
            cookies: CookieConfig::default(),
            profiles_root: None,
            container_library: None,
            download_root: None,
            debug: DebugConfig::default(),
        }
    }
}

impl AppConfig {
    /// Get default Chrome path based on platform
    fn default_chrome_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            PathBuf::from("C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe")
        }
        #[cfg(target_os = "macos")]
        {
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
        }
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/usr/bin/google-chrome")
        }
    }

    /// Apply environment overrides. Called once at startup, after the TOML
    /// load, so env vars win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("WEBAUTO_BROWSER_URL") {
            self.service.browser_url = url;
        }
        if let Ok(root) = std::env::var("WEBAUTO_DOWNLOAD_ROOT") {
            self.download_root = Some(PathBuf::from(root));
        } else if let Ok(dir) = std::env::var("WEBAUTO_DOWNLOAD_DIR") {
            self.download_root = Some(PathBuf::from(dir));
        }
        if let Ok(root) = std::env::var("WEBAUTO_REPO_ROOT") {
            self.service.repo_root = Some(PathBuf::from(root));
        }
        self.debug.enabled |= env_flag("WEBAUTO_DEBUG");
        self.debug.artifacts |= env_flag("WEBAUTO_DEBUG_ARTIFACTS");
        self.debug.screenshots |= env_flag("WEBAUTO_DEBUG_SCREENSHOT");
        self.service.auto_exit |= env_flag("BROWSER_SERVICE_AUTO_EXIT");
        self.service.like_gate_bypass |= env_flag("WEBAUTO_LIKE_GATE_BYPASS");
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unified API port (HTTP + /ws + /bus)
    #[serde(default = "default_unified_port")]
    pub unified_port: u16,

    /// Browser service HTTP port (/command, /health)
    #[serde(default = "default_browser_port")]
    pub browser_port: u16,

    /// Browser service WebSocket port (session events)
    #[serde(default = "default_events_port")]
    pub events_port: u16,

    /// Browser service endpoint used by workflow clients
    #[serde(default = "default_browser_url")]
    pub browser_url: String,

    /// Where the browser-service start script lives; auto-discovered otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<PathBuf>,

    /// Exit the service when no sessions remain
    #[serde(default)]
    pub auto_exit: bool,

    /// Disable the external like-rate gate (test only)
    #[serde(default)]
    pub like_gate_bypass: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unified_port: default_unified_port(),
            browser_port: default_browser_port(),
            events_port: default_events_port(),
            browser_url: default_browser_url(),
            repo_root: None,
            auto_exit: false,
            like_gate_bypass: false,
        }
    }
}

fn default_unified_port() -> u16 {
    7701
}

fn default_browser_port() -> u16 {
    7704
}

fn default_events_port() -> u16 {
    8765
}

fn default_browser_url() -> String {
    "http://127.0.0.1:7704".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserDefaults {
    /// Default viewport width/height for new sessions
    #[serde(default = "default_viewport_w")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_h")]
    pub viewport_height: u32,

    /// OS work area the viewport is clamped against
    #[serde(default = "default_work_area_w")]
    pub work_area_width: u32,
    #[serde(default = "default_work_area_h")]
    pub work_area_height: u32,

    #[serde(default)]
    pub headless: bool,

    #[serde(default = "default_lang")]
    pub lang: String,

    /// Proxy server (e.g., "http://192.168.0.220:8889")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_server: Option<String>,

    /// Fingerprint ID passed to the hardened Chrome build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Timezone (e.g., "Asia/Shanghai")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Extra launch arguments appended to every session
    #[serde(default)]
    pub custom_args: Vec<String>,
}

impl Default for BrowserDefaults {
    fn default() -> Self {
        Self {
            viewport_width: default_viewport_w(),
            viewport_height: default_viewport_h(),
            work_area_width: default_work_area_w(),
            work_area_height: default_work_area_h(),
            headless: false,
            lang: default_lang(),
            proxy_server: None,
            fingerprint: None,
            timezone: None,
            custom_args: Vec::new(),
        }
    }
}

fn default_viewport_w() -> u32 {
    1280
}

fn default_viewport_h() -> u32 {
    800
}

fn default_work_area_w() -> u32 {
    1920
}

fn default_work_area_h() -> u32 {
    1080
}

fn default_lang() -> String {
    "zh-CN".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Autosave cadence
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_ms: u64,

    /// Snapshot must be unchanged this long before a save is allowed
    #[serde(default = "default_min_delay")]
    pub stability_min_delay_ms: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ms: default_autosave_interval(),
            stability_min_delay_ms: default_min_delay(),
        }
    }
}

fn default_autosave_interval() -> u64 {
    30_000
}

fn default_min_delay() -> u64 {
    2_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Write trace bundles on unrecoverable workflow failure
    #[serde(default)]
    pub artifacts: bool,
    #[serde(default)]
    pub screenshots: bool,
}

/// Root of the on-disk layout: ~/.webauto
pub fn webauto_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webauto")
}

impl AppConfig {
    pub fn profiles_dir(&self) -> PathBuf {
        self.profiles_root
            .clone()
            .unwrap_or_else(|| webauto_home().join("profiles"))
    }

    pub fn cookies_dir(&self) -> PathBuf {
        webauto_home().join("cookies")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.container_library
            .clone()
            .unwrap_or_else(|| webauto_home().join("containers"))
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_root
            .clone()
            .unwrap_or_else(|| webauto_home().join("download"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let config = AppConfig::default();
        assert_eq!(config.service.unified_port, 7701);
        assert_eq!(config.service.browser_port, 7704);
        assert_eq!(config.service.events_port, 8765);
        assert_eq!(config.service.browser_url, "http://127.0.0.1:7704");
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.cookies.stability_min_delay_ms, 2_000);
        assert_eq!(parsed.browser.viewport_width, 1280);
    }

    #[test]
    fn test_paths_land_under_webauto_home() {
        let config = AppConfig::default();
        assert!(config.profiles_dir().ends_with(".webauto/profiles"));
        assert!(config.cookies_dir().ends_with(".webauto/cookies"));
        assert!(config.download_dir().ends_with(".webauto/download"));
    }
}
