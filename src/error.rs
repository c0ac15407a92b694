use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WebautoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile {profile_id} is locked by pid {owner_pid}")]
    ProfileBusy { profile_id: String, owner_pid: u32 },

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("No session for profile: {0}")]
    SessionNotFound(String),

    #[error("Session crashed: {0}")]
    SessionCrashed(String),

    #[error("CDP transport error: {0}")]
    Cdp(String),

    #[error("Action '{action}' timed out after {timeout_ms}ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("Event bus overflow")]
    BusOverflow,

    #[error("Subscription buffer overflow for {0}")]
    SubscriptionOverflow(String),

    #[error("Container {container_id} is out of scope for {url}")]
    ContainerOutOfScope { container_id: String, url: String },

    #[error("No selector variant of {0} matched the page")]
    ContainerNoMatch(String),

    #[error("Click on {0} produced no observable effect")]
    ClickNoEffect(String),

    #[error("No focused editable element to type into")]
    TypeNoFocus,

    #[error("Extract on {0} yielded no rows")]
    ExtractEmpty(String),

    #[error("Scroll on {0} made no progress")]
    ScrollNoProgress(String),

    #[error("Pre-validation failed for block {0}")]
    ValidationPreFailed(String),

    #[error("Post-validation failed for block {0}")]
    ValidationPostFailed(String),

    #[error("Checkpoint {target} unreachable (last seen: {last})")]
    CheckpointUnreachable { target: String, last: String },

    #[error("Block {block} depends on failed block {dependency}")]
    DependencyFailed { block: String, dependency: String },

    #[error("Login guard detected on {0}")]
    LoginGuardDetected(String),

    #[error("Risk control page detected on {0}")]
    RiskControlDetected(String),
}

pub type Result<T> = std::result::Result<T, WebautoError>;

impl WebautoError {
    /// Stable wire code for the API error envelope. Transport-internal
    /// variants (IO, TOML, JSON) map onto the nearest lifecycle code.
    pub fn code(&self) -> &'static str {
        match self {
            WebautoError::ProfileBusy { .. } => "PROFILE_BUSY",
            WebautoError::BrowserLaunchFailed(_) => "BROWSER_LAUNCH_FAILED",
            WebautoError::SessionNotFound(_) | WebautoError::ProfileNotFound(_) => {
                "SESSION_NOT_FOUND"
            }
            WebautoError::SessionCrashed(_) => "SESSION_CRASHED",
            WebautoError::ActionTimeout { .. } => "ACTION_TIMEOUT",
            WebautoError::BusOverflow => "BUS_OVERFLOW",
            WebautoError::SubscriptionOverflow(_) => "SUBSCRIPTION_OVERFLOW",
            WebautoError::ContainerOutOfScope { .. } => "CONTAINER_OUT_OF_SCOPE",
            WebautoError::ContainerNoMatch(_) => "CONTAINER_NO_MATCH",
            WebautoError::ClickNoEffect(_) => "CLICK_NO_EFFECT",
            WebautoError::TypeNoFocus => "TYPE_NO_FOCUS",
            WebautoError::ExtractEmpty(_) => "EXTRACT_EMPTY",
            WebautoError::ScrollNoProgress(_) => "SCROLL_NO_PROGRESS",
            WebautoError::ValidationPreFailed(_) => "VALIDATION_PRE_FAILED",
            WebautoError::ValidationPostFailed(_) => "VALIDATION_POST_FAILED",
            WebautoError::CheckpointUnreachable { .. } => "CHECKPOINT_UNREACHABLE",
            WebautoError::DependencyFailed { .. } => "DEPENDENCY_FAILED",
            WebautoError::LoginGuardDetected(_) => "LOGIN_GUARD_DETECTED",
            WebautoError::RiskControlDetected(_) => "RISK_CONTROL_DETECTED",
            WebautoError::Validation(_) => "VALIDATION_ERROR",
            WebautoError::Cdp(_) => "CDP_ERROR",
            WebautoError::Io(_)
            | WebautoError::Config(_)
            | WebautoError::TomlSerialize(_)
            | WebautoError::TomlDeserialize(_)
            | WebautoError::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Guard errors are hard stops for the workflow runtime.
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            WebautoError::LoginGuardDetected(_) | WebautoError::RiskControlDetected(_)
        )
    }
}

/// Error shape crossing the API, identical over HTTP and WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&WebautoError> for WireError {
    fn from(err: &WebautoError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            WebautoError::ProfileBusy {
                profile_id: "xhs_fresh".into(),
                owner_pid: 42
            }
            .code(),
            "PROFILE_BUSY"
        );
        assert_eq!(
            WebautoError::ContainerNoMatch("xiaohongshu_search".into()).code(),
            "CONTAINER_NO_MATCH"
        );
        assert_eq!(
            WebautoError::ActionTimeout {
                action: "browser:goto".into(),
                timeout_ms: 5000
            }
            .code(),
            "ACTION_TIMEOUT"
        );
    }

    #[test]
    fn test_guard_errors_are_hard_stops() {
        assert!(WebautoError::RiskControlDetected("xiaohongshu".into()).is_guard());
        assert!(WebautoError::LoginGuardDetected("weibo".into()).is_guard());
        assert!(!WebautoError::ContainerNoMatch("x".into()).is_guard());
    }

    #[test]
    fn test_wire_error_serialization() {
        let err = WebautoError::SessionNotFound("xhs_fresh".into());
        let wire = WireError::from(&err);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["code"], "SESSION_NOT_FOUND");
        assert!(json.get("details").is_none());
    }
}
