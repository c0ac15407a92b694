//! Cookie snapshot model shared by the store and the CDP layer.

use serde::{Deserialize, Serialize};

/// One cookie as reported by CDP `Network.getCookies`. Fields the browser
/// doesn't set are defaulted so snapshots from older Chrome builds parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; -1 for session cookies.
    #[serde(default = "default_expires")]
    pub expires: f64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_expires() -> f64 {
    -1.0
}

/// The sorted `name=value` projection used for snapshot equivalence.
/// Domain, path and expiry churn (server-driven refreshes of the same
/// values) do not make two snapshots different.
pub fn projection(cookies: &[Cookie]) -> Vec<String> {
    let mut keys: Vec<String> = cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    keys.sort();
    keys
}

/// Two snapshots are equivalent iff their projections are equal.
pub fn equivalent(a: &[Cookie], b: &[Cookie]) -> bool {
    projection(a) == projection(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str, value: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: ".xiaohongshu.com".to_string(),
            path: "/".to_string(),
            expires: -1.0,
            secure: true,
            http_only: false,
            same_site: None,
        }
    }

    #[test]
    fn test_projection_is_order_independent() {
        let a = vec![cookie("web_session", "abc"), cookie("a1", "xyz")];
        let b = vec![cookie("a1", "xyz"), cookie("web_session", "abc")];
        assert!(equivalent(&a, &b));
    }

    #[test]
    fn test_value_change_breaks_equivalence() {
        let a = vec![cookie("web_session", "abc")];
        let b = vec![cookie("web_session", "def")];
        assert!(!equivalent(&a, &b));
    }

    #[test]
    fn test_expiry_churn_is_equivalent() {
        let mut a = vec![cookie("web_session", "abc")];
        let mut b = vec![cookie("web_session", "abc")];
        a[0].expires = 1_700_000_000.0;
        b[0].expires = 1_800_000_000.0;
        assert!(equivalent(&a, &b));
    }

    #[test]
    fn test_cdp_shape_deserializes() {
        let json = serde_json::json!({
            "name": "web_session",
            "value": "abc",
            "domain": ".xiaohongshu.com",
            "path": "/",
            "expires": 1234.5,
            "secure": true,
            "httpOnly": true,
            "sameSite": "Lax",
            "size": 11,
            "session": false
        });
        let c: Cookie = serde_json::from_value(json).unwrap();
        assert!(c.http_only);
        assert_eq!(c.same_site.as_deref(), Some("Lax"));
    }
}
