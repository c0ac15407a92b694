//! The command envelope shared by `/v1/controller/action` and `/command`.
//!
//! One discriminant `action`; per-action payload shapes are validated at
//! the boundary by the dispatch table. HTTP status reflects transport
//! only: business failures ride `success=false`.

use crate::error::{WebautoError, WireError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Namespaced verb, e.g. `browser:goto`, `container:operation`.
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Deadline for the whole action; expiry reports `ACTION_TIMEOUT`
    /// without tearing the session down.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ActionResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &WebautoError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(WireError::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_with_defaults() {
        let req: ActionRequest =
            serde_json::from_str(r#"{"action": "session:list"}"#).unwrap();
        assert_eq!(req.action, "session:list");
        assert!(req.payload.is_null());
        assert!(req.timeout_ms.is_none());
    }

    #[test]
    fn test_response_shapes() {
        let ok = ActionResponse::ok(serde_json::json!({"n": 1}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());

        let err = ActionResponse::err(&WebautoError::SessionNotFound("xhs_fresh".into()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "SESSION_NOT_FOUND");
        assert!(json.get("data").is_none());
    }
}
