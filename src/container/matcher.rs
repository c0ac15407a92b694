//! DOM matcher: locate containers on the live page.
//!
//! The matcher is stateless. Indices and signatures identify a matched
//! region only for the duration of a single render; callers re-match
//! before acting on one.

use crate::container::registry::ContainerRegistry;
use crate::container::schema::{ContainerDef, SelectorVariant};
use crate::error::{Result, WebautoError};
use crate::persist::shard::fnv1a64;
use crate::session::BrowserSession;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MATCH_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.w * self.h
    }
}

/// System-level identity of a matched region within one page render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub container_id: String,
    pub index: usize,
    pub rect: Rect,
    pub in_viewport: bool,
    pub variant_used: String,
    pub signature: String,
}

/// Raw candidate row returned by the in-page probe.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Candidate {
    pub rect: Rect,
    #[serde(rename = "inViewport")]
    pub in_viewport: bool,
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub cls: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Match one container against the current page. Selector variants are
/// tried in declared order; the first yielding ≥1 candidate wins.
pub async fn match_container(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    timeout_ms: u64,
) -> Result<Vec<MatchResult>> {
    let def = registry
        .get(container_id)
        .ok_or_else(|| WebautoError::Validation(format!("Unknown container: {}", container_id)))?;

    let url = session.url().await?;
    if !registry.in_scope(container_id, &url) {
        return Err(WebautoError::ContainerOutOfScope {
            container_id: container_id.to_string(),
            url,
        });
    }

    match_in_scope(session, def, timeout_ms).await
}

/// Match without the URL-scope gate. The checkpoint detector uses this for
/// guard probes that must fire on any URL (offsite detection).
pub async fn match_in_scope(
    session: &BrowserSession,
    def: &ContainerDef,
    timeout_ms: u64,
) -> Result<Vec<MatchResult>> {
    for sel in &def.selectors {
        let script = probe_script(sel);
        let value = session.evaluate(&script, timeout_ms).await?;
        let rows: Vec<Candidate> = serde_json::from_value(value).unwrap_or_default();
        if !rows.is_empty() {
            return Ok(build_results(&def.id, &sel.variant, rows));
        }
    }
    Err(WebautoError::ContainerNoMatch(def.id.clone()))
}

/// True when the container currently matches (scope errors propagate,
/// no-match does not).
pub async fn exists(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
) -> Result<bool> {
    match match_container(session, registry, container_id, DEFAULT_MATCH_TIMEOUT_MS).await {
        Ok(results) => Ok(!results.is_empty()),
        Err(WebautoError::ContainerNoMatch(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// The in-page probe for one selector variant. Visibility is positive
/// area, viewport intersection, and a center hit-test resolving to the
/// element or a descendant.
fn probe_script(sel: &SelectorVariant) -> String {
    let css_json = serde_json::to_string(&sel.css).unwrap_or_default();
    let text_json = serde_json::to_string(&sel.require_text).unwrap_or_else(|_| "null".into());
    format!(
        r#"(function() {{
            const sel = {css_json};
            const requireText = {text_json};
            const requireVisible = {require_visible};
            const vw = window.innerWidth, vh = window.innerHeight;
            const rows = [];
            for (const el of document.querySelectorAll(sel)) {{
                const r = el.getBoundingClientRect();
                const hasArea = r.width > 0 && r.height > 0;
                const inViewport = hasArea && r.right > 0 && r.bottom > 0 && r.left < vw && r.top < vh;
                let hit = false;
                if (inViewport) {{
                    const cx = Math.min(Math.max(r.left + r.width / 2, 0), vw - 1);
                    const cy = Math.min(Math.max(r.top + r.height / 2, 0), vh - 1);
                    const at = document.elementFromPoint(cx, cy);
                    hit = at === el || el.contains(at);
                }}
                if (requireVisible && !(hasArea && inViewport && hit)) continue;
                const text = (el.innerText || el.textContent || '').trim();
                if (requireText && !text.includes(requireText)) continue;
                rows.push({{
                    rect: {{ x: r.left, y: r.top, w: r.width, h: r.height }},
                    inViewport: inViewport,
                    tag: el.tagName.toLowerCase(),
                    id: el.id || null,
                    cls: (el.className && typeof el.className === 'string')
                        ? (el.className.trim().split(/\s+/)[0] || null) : null,
                    text: text.substring(0, 40)
                }});
            }}
            return rows;
        }})()"#,
        css_json = css_json,
        text_json = text_json,
        require_visible = sel.require_visible,
    )
}

pub(crate) fn build_results(
    container_id: &str,
    variant: &str,
    rows: Vec<Candidate>,
) -> Vec<MatchResult> {
    rows.into_iter()
        .enumerate()
        .map(|(index, c)| MatchResult {
            container_id: container_id.to_string(),
            index,
            signature: signature_of(&c),
            rect: c.rect,
            in_viewport: c.in_viewport,
            variant_used: variant.to_string(),
        })
        .collect()
}

/// Stable signature from (tag, id?, class-prefix, text[:40]). Identical
/// across repeated matches of the same render.
pub(crate) fn signature_of(c: &Candidate) -> String {
    let mut key = String::with_capacity(64);
    key.push_str(&c.tag);
    if let Some(id) = &c.id {
        key.push('#');
        key.push_str(id);
    }
    if let Some(cls) = &c.cls {
        key.push('.');
        key.push_str(cls);
    }
    key.push('|');
    key.push_str(&c.text);
    format!("{:016x}", fnv1a64(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tag: &str, id: Option<&str>, cls: Option<&str>, text: &str) -> Candidate {
        Candidate {
            rect: Rect {
                x: 10.0,
                y: 20.0,
                w: 200.0,
                h: 100.0,
            },
            in_viewport: true,
            tag: tag.to_string(),
            id: id.map(String::from),
            cls: cls.map(String::from),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = candidate("section", None, Some("note-item"), "红茶测评");
        let b = candidate("section", None, Some("note-item"), "红茶测评");
        assert_eq!(signature_of(&a), signature_of(&b));
    }

    #[test]
    fn test_signature_distinguishes_text() {
        let a = candidate("section", None, Some("note-item"), "红茶测评");
        let b = candidate("section", None, Some("note-item"), "绿茶测评");
        assert_ne!(signature_of(&a), signature_of(&b));
    }

    #[test]
    fn test_build_results_preserves_dom_order() {
        let rows = vec![
            candidate("section", Some("n1"), None, "first"),
            candidate("section", Some("n2"), None, "second"),
        ];
        let results = build_results("xiaohongshu_search.search_result_item", "primary", rows);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[1].index, 1);
        assert_eq!(results[0].variant_used, "primary");
        assert_ne!(results[0].signature, results[1].signature);
    }

    #[test]
    fn test_rect_center() {
        let r = Rect {
            x: 10.0,
            y: 20.0,
            w: 100.0,
            h: 50.0,
        };
        assert_eq!(r.center(), (60.0, 45.0));
    }

    #[test]
    fn test_probe_script_quotes_selector() {
        let sel = SelectorVariant {
            variant: "primary".into(),
            css: "section[data-note='a\"b']".into(),
            require_visible: true,
            require_text: Some("测评".into()),
        };
        let script = probe_script(&sel);
        assert!(script.contains(r#"section[data-note='a\"b']"#));
        assert!(script.contains("测评"));
        assert!(script.contains("requireVisible = true"));
    }

    #[test]
    fn test_match_result_wire_shape() {
        let results = build_results(
            "xiaohongshu_search.search_result_item",
            "fallback-1",
            vec![candidate("section", None, None, "t")],
        );
        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["containerId"], "xiaohongshu_search.search_result_item");
        assert_eq!(json["variantUsed"], "fallback-1");
        assert!(json["inViewport"].as_bool().unwrap());
        assert_eq!(json["signature"].as_str().unwrap().len(), 16);
    }
}
