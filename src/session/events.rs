//! Session lifecycle events pushed onto the event planes.

use serde::Serialize;

/// Wire names follow the `session:*` / `page:*` action namespaces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    #[serde(rename = "session:created")]
    Created { profile_id: String },
    #[serde(rename = "session:destroyed")]
    Destroyed { profile_id: String },
    #[serde(rename = "session:crashed")]
    Crashed { profile_id: String },
    #[serde(rename = "page:navigated")]
    Navigated { profile_id: String, url: String },
    #[serde(rename = "page:opened")]
    PageOpened { profile_id: String, index: usize },
    #[serde(rename = "page:closed")]
    PageClosed { profile_id: String, index: usize },
}

impl SessionEvent {
    pub fn profile_id(&self) -> &str {
        match self {
            SessionEvent::Created { profile_id }
            | SessionEvent::Destroyed { profile_id }
            | SessionEvent::Crashed { profile_id }
            | SessionEvent::Navigated { profile_id, .. }
            | SessionEvent::PageOpened { profile_id, .. }
            | SessionEvent::PageClosed { profile_id, .. } => profile_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let ev = SessionEvent::Crashed {
            profile_id: "xhs_fresh".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "session:crashed");
        assert_eq!(json["data"]["profile_id"], "xhs_fresh");
    }
}
