//! Operation executor: the fixed vocabulary dispatched against matched
//! containers.
//!
//! Gestures are system-input only. A click resolves to one CDP-level
//! mouse event at verified viewport coordinates; `element.click()` never
//! happens. Containers must declare an operation before it can run
//! against them.

use crate::container::matcher::{self, MatchResult, Rect, DEFAULT_MATCH_TIMEOUT_MS};
use crate::container::registry::ContainerRegistry;
use crate::container::schema::{ContainerDef, OperationId};
use crate::error::{Result, WebautoError};
use crate::session::BrowserSession;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Inset used for the padded edge-midpoint click candidates.
const CLICK_EDGE_PADDING: f64 = 4.0;

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightConfig {
    #[serde(default)]
    pub index: usize,
    #[serde(default = "default_highlight_duration")]
    pub duration_ms: u64,
    /// Bus channel tag echoed in the outcome, for observers.
    #[serde(default)]
    pub channel: Option<String>,
    /// CSS outline style override.
    #[serde(default)]
    pub style: Option<String>,
}

fn default_highlight_duration() -> u64 {
    1_500
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            index: 0,
            duration_ms: default_highlight_duration(),
            channel: None,
            style: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    /// Field subset; all declared fields when absent.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub visible_only: bool,
}

/// Caller-supplied post-condition for the click gate.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClickVerify {
    UrlChanged,
    ContainerGone { container: String },
    ContainerAppears { container: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickConfig {
    #[serde(default)]
    pub index: usize,
    /// Inner selector refining the click point within the matched rect.
    #[serde(default)]
    pub target: Option<String>,
    /// Post-condition; when absent the click is trusted after dispatch.
    #[serde(default)]
    pub verify: Option<ClickVerify>,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,
}

fn default_verify_timeout() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollConfig {
    #[serde(default)]
    pub index: usize,
    pub direction: ScrollDirection,
    #[serde(default = "default_scroll_amount", alias = "distance")]
    pub amount: f64,
}

fn default_scroll_amount() -> f64 {
    600.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeConfig {
    pub text: String,
    #[serde(default = "default_type_delay")]
    pub delay_ms: u64,
    #[serde(default)]
    pub submit: bool,
}

fn default_type_delay() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightOutcome {
    pub rect: Rect,
    pub in_viewport: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOutcome {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickOutcome {
    pub x: f64,
    pub y: f64,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollOutcome {
    pub scrolled_px: f64,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Draw a temporary overlay on the matched rect. The overlay ignores
/// pointer events, so it cannot swallow a subsequent click.
pub async fn highlight(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    cfg: HighlightConfig,
) -> Result<HighlightOutcome> {
    let (def, matched) = resolve(session, registry, container_id, OperationId::Highlight).await?;
    let target = nth(&matched, cfg.index, &def.id)?;

    let style = cfg
        .style
        .clone()
        .unwrap_or_else(|| "2px solid #ff2442".to_string());
    let script = format!(
        r#"(function() {{
            const el = document.createElement('div');
            el.style.cssText = 'position:fixed;z-index:2147483646;pointer-events:none;'
                + 'left:{x}px;top:{y}px;width:{w}px;height:{h}px;outline:{style};';
            document.body.appendChild(el);
            setTimeout(() => el.remove(), {duration});
            return true;
        }})()"#,
        x = target.rect.x,
        y = target.rect.y,
        w = target.rect.w,
        h = target.rect.h,
        style = style,
        duration = cfg.duration_ms,
    );
    session.evaluate(&script, DEFAULT_MATCH_TIMEOUT_MS).await?;

    Ok(HighlightOutcome {
        rect: target.rect,
        in_viewport: target.in_viewport,
        channel: cfg.channel,
    })
}

/// Extract declared fields from matched elements, rows in DOM order.
pub async fn extract(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    cfg: ExtractConfig,
) -> Result<ExtractOutcome> {
    let (def, matched) = resolve(session, registry, container_id, OperationId::Extract).await?;
    let variant = variant_css(&def, &matched[0].variant_used)?;

    let fields: Vec<&crate::container::schema::ExtractField> = match &cfg.fields {
        Some(wanted) => def
            .extract_fields
            .iter()
            .filter(|f| wanted.contains(&f.name))
            .collect(),
        None => def.extract_fields.iter().collect(),
    };

    let field_spec: Vec<serde_json::Value> = fields
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "selector": f.selector,
                "attr": f.attr,
            })
        })
        .collect();

    let script = format!(
        r#"(function() {{
            const fields = {fields};
            const visibleOnly = {visible_only};
            const maxItems = {max_items};
            const vw = window.innerWidth, vh = window.innerHeight;
            const rows = [];
            for (const el of document.querySelectorAll({css})) {{
                if (visibleOnly) {{
                    const r = el.getBoundingClientRect();
                    const hasArea = r.width > 0 && r.height > 0;
                    const inView = hasArea && r.right > 0 && r.bottom > 0 && r.left < vw && r.top < vh;
                    if (!inView) continue;
                }}
                const row = {{}};
                if (fields.length === 0) {{
                    row.text = (el.innerText || el.textContent || '').trim();
                }}
                for (const f of fields) {{
                    const node = f.selector ? el.querySelector(f.selector) : el;
                    if (!node) {{ row[f.name] = null; continue; }}
                    row[f.name] = f.attr
                        ? node.getAttribute(f.attr)
                        : (node.innerText || node.textContent || '').trim();
                }}
                rows.push(row);
                if (maxItems > 0 && rows.length >= maxItems) break;
            }}
            return rows;
        }})()"#,
        fields = serde_json::Value::Array(field_spec),
        visible_only = cfg.visible_only,
        max_items = cfg.max_items.unwrap_or(0),
        css = serde_json::to_string(&variant.css)?,
    );

    let value = session.evaluate(&script, DEFAULT_MATCH_TIMEOUT_MS).await?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_value(value).unwrap_or_default();

    if rows.is_empty() {
        return Err(WebautoError::ExtractEmpty(def.id.clone()));
    }
    Ok(ExtractOutcome {
        count: rows.len(),
        rows,
    })
}

/// The rigid click gate.
///
/// 1. Re-match and confirm rect identity by signature.
/// 2. Candidate points: center, then four padded edge midpoints; points
///    outside the viewport are rejected.
/// 3. A candidate is accepted only if `document.elementFromPoint` resolves
///    to the target element or a descendant.
/// 4. One CDP-level click at the accepted coordinate.
/// 5. The caller-supplied post-condition decides success; on failure the
///    error is `CLICK_NO_EFFECT` and there is no retry here.
pub async fn click(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    cfg: ClickConfig,
) -> Result<ClickOutcome> {
    let (def, first) = resolve(session, registry, container_id, OperationId::Click).await?;
    let expected = nth(&first, cfg.index, &def.id)?.clone();

    // Re-match just before acting; a drifted render invalidates the click.
    let rematched = matcher::match_in_scope(session, &def, DEFAULT_MATCH_TIMEOUT_MS).await?;
    let target = nth(&rematched, cfg.index, &def.id)?;
    if target.signature != expected.signature {
        return Err(WebautoError::ClickNoEffect(format!(
            "{}: render drifted between match and click",
            def.id
        )));
    }

    let variant = variant_css(&def, &target.variant_used)?;
    let url_before = session.url().await?;

    let (vw, vh) = viewport_size(session).await?;
    let point = accept_click_point(
        session,
        &variant.css,
        cfg.target.as_deref(),
        cfg.index,
        &target.rect,
        (vw, vh),
    )
    .await?
    .ok_or_else(|| {
        WebautoError::ClickNoEffect(format!("{}: no hit-testable click point", def.id))
    })?;

    session.mouse_click(point.0, point.1, 1).await?;
    tracing::debug!(
        "Clicked {}[{}] at ({:.1}, {:.1})",
        def.id,
        cfg.index,
        point.0,
        point.1
    );

    if let Some(verify) = &cfg.verify {
        verify_click(session, registry, verify, &url_before, cfg.verify_timeout_ms)
            .await
            .map_err(|_| WebautoError::ClickNoEffect(def.id.clone()))?;
    }

    Ok(ClickOutcome {
        x: point.0,
        y: point.1,
        signature: target.signature.clone(),
    })
}

/// Scroll within the container's scrollable ancestor, or the page when
/// there is none. No movement reports `SCROLL_NO_PROGRESS`.
pub async fn scroll(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    cfg: ScrollConfig,
) -> Result<ScrollOutcome> {
    let (def, matched) = resolve(session, registry, container_id, OperationId::Scroll).await?;
    let target = nth(&matched, cfg.index, &def.id)?;
    let variant = variant_css(&def, &target.variant_used)?;

    let delta = match cfg.direction {
        ScrollDirection::Up => -cfg.amount.abs(),
        ScrollDirection::Down => cfg.amount.abs(),
    };

    let script = format!(
        r#"(function() {{
            const els = document.querySelectorAll({css});
            const el = els[{index}];
            if (!el) return null;
            let scroller = el;
            while (scroller && scroller !== document.body) {{
                const style = getComputedStyle(scroller);
                const scrollable = /(auto|scroll)/.test(style.overflowY)
                    && scroller.scrollHeight > scroller.clientHeight;
                if (scrollable) break;
                scroller = scroller.parentElement;
            }}
            if (scroller && scroller !== document.body) {{
                const before = scroller.scrollTop;
                scroller.scrollBy(0, {delta});
                return scroller.scrollTop - before;
            }}
            const before = window.scrollY;
            window.scrollBy(0, {delta});
            return window.scrollY - before;
        }})()"#,
        css = serde_json::to_string(&variant.css)?,
        index = cfg.index,
        delta = delta,
    );

    let moved = session
        .evaluate(&script, DEFAULT_MATCH_TIMEOUT_MS)
        .await?
        .as_f64()
        .unwrap_or(0.0);

    if moved.abs() < 1.0 {
        return Err(WebautoError::ScrollNoProgress(def.id.clone()));
    }
    Ok(ScrollOutcome { scrolled_px: moved })
}

/// Keystroke stream into the focused input. Focus is the caller's job (a
/// preceding click); typing without one is `TYPE_NO_FOCUS`.
pub async fn type_text(session: &BrowserSession, cfg: TypeConfig) -> Result<()> {
    let focused = session
        .evaluate(
            "(function() { \
                const el = document.activeElement; \
                if (!el) return false; \
                const tag = el.tagName; \
                return tag === 'INPUT' || tag === 'TEXTAREA' || el.isContentEditable === true; \
            })()",
            DEFAULT_MATCH_TIMEOUT_MS,
        )
        .await?
        .as_bool()
        .unwrap_or(false);

    if !focused {
        return Err(WebautoError::TypeNoFocus);
    }

    session.type_text(&cfg.text, cfg.delay_ms, cfg.submit).await
}

// ---------------------------------------------------------------------------
// Click-gate internals
// ---------------------------------------------------------------------------

/// Candidate click points: center first, then padded edge midpoints.
pub(crate) fn candidate_points(rect: &Rect) -> Vec<(f64, f64)> {
    let (cx, cy) = rect.center();
    let p = CLICK_EDGE_PADDING.min(rect.w / 2.0).min(rect.h / 2.0);
    vec![
        (cx, cy),
        (cx, rect.y + p),
        (cx, rect.y + rect.h - p),
        (rect.x + p, cy),
        (rect.x + rect.w - p, cy),
    ]
}

pub(crate) fn in_viewport_point(point: (f64, f64), viewport: (f64, f64)) -> bool {
    point.0 >= 0.0 && point.1 >= 0.0 && point.0 < viewport.0 && point.1 < viewport.1
}

async fn viewport_size(session: &BrowserSession) -> Result<(f64, f64)> {
    let value = session
        .evaluate(
            "({ w: window.innerWidth, h: window.innerHeight })",
            DEFAULT_MATCH_TIMEOUT_MS,
        )
        .await?;
    Ok((
        value.get("w").and_then(|v| v.as_f64()).unwrap_or(0.0),
        value.get("h").and_then(|v| v.as_f64()).unwrap_or(0.0),
    ))
}

/// Find the first candidate point whose hit-test lands on the target (or
/// the inner target when one is declared).
async fn accept_click_point(
    session: &BrowserSession,
    css: &str,
    inner: Option<&str>,
    index: usize,
    rect: &Rect,
    viewport: (f64, f64),
) -> Result<Option<(f64, f64)>> {
    for point in candidate_points(rect) {
        if !in_viewport_point(point, viewport) {
            continue;
        }
        let script = format!(
            r#"(function() {{
                const els = document.querySelectorAll({css});
                let el = els[{index}];
                if (!el) return false;
                const inner = {inner};
                if (inner) {{
                    el = el.querySelector(inner);
                    if (!el) return false;
                }}
                const at = document.elementFromPoint({x}, {y});
                return at === el || el.contains(at);
            }})()"#,
            css = serde_json::to_string(css)?,
            index = index,
            inner = serde_json::to_string(&inner)?,
            x = point.0,
            y = point.1,
        );
        let hit = session
            .evaluate(&script, DEFAULT_MATCH_TIMEOUT_MS)
            .await?
            .as_bool()
            .unwrap_or(false);
        if hit {
            return Ok(Some(point));
        }
    }
    Ok(None)
}

async fn verify_click(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    verify: &ClickVerify,
    url_before: &str,
    timeout_ms: u64,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(timeout_ms);
    loop {
        let satisfied = match verify {
            ClickVerify::UrlChanged => session.url().await? != url_before,
            ClickVerify::ContainerGone { container } => {
                !matcher::exists(session, registry, container)
                    .await
                    .unwrap_or(true)
            }
            ClickVerify::ContainerAppears { container } => {
                matcher::exists(session, registry, container)
                    .await
                    .unwrap_or(false)
            }
        };
        if satisfied {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WebautoError::ClickNoEffect("post-condition".to_string()));
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

async fn resolve(
    session: &BrowserSession,
    registry: &ContainerRegistry,
    container_id: &str,
    op: OperationId,
) -> Result<(ContainerDef, Vec<MatchResult>)> {
    let def = registry
        .get(container_id)
        .ok_or_else(|| WebautoError::Validation(format!("Unknown container: {}", container_id)))?
        .clone();
    if !def.allows(op) {
        return Err(WebautoError::Validation(format!(
            "Container {} does not declare operation '{}'",
            container_id, op
        )));
    }
    let matched =
        matcher::match_container(session, registry, container_id, DEFAULT_MATCH_TIMEOUT_MS).await?;
    Ok((def, matched))
}

fn nth<'a>(matched: &'a [MatchResult], index: usize, id: &str) -> Result<&'a MatchResult> {
    matched
        .get(index)
        .ok_or_else(|| WebautoError::ContainerNoMatch(format!("{}[{}]", id, index)))
}

fn variant_css<'a>(
    def: &'a ContainerDef,
    variant: &str,
) -> Result<&'a crate::container::schema::SelectorVariant> {
    def.selectors
        .iter()
        .find(|s| s.variant == variant)
        .ok_or_else(|| {
            WebautoError::Validation(format!("{}: unknown variant '{}'", def.id, variant))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_points_center_first() {
        let rect = Rect {
            x: 100.0,
            y: 200.0,
            w: 80.0,
            h: 40.0,
        };
        let points = candidate_points(&rect);
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], (140.0, 220.0));
        // Padded top edge midpoint.
        assert_eq!(points[1], (140.0, 204.0));
        // Padded left edge midpoint.
        assert_eq!(points[3], (104.0, 220.0));
    }

    #[test]
    fn test_candidate_points_clamp_padding_for_tiny_rects() {
        let rect = Rect {
            x: 0.0,
            y: 0.0,
            w: 4.0,
            h: 4.0,
        };
        for (x, y) in candidate_points(&rect) {
            assert!(x >= 0.0 && x <= 4.0);
            assert!(y >= 0.0 && y <= 4.0);
        }
    }

    #[test]
    fn test_viewport_point_rejection() {
        let viewport = (1280.0, 800.0);
        assert!(in_viewport_point((100.0, 100.0), viewport));
        assert!(!in_viewport_point((-1.0, 100.0), viewport));
        assert!(!in_viewport_point((100.0, 800.0), viewport));
        assert!(!in_viewport_point((1280.0, 100.0), viewport));
    }

    #[test]
    fn test_click_config_defaults() {
        let cfg: ClickConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.index, 0);
        assert!(cfg.verify.is_none());
        assert_eq!(cfg.verify_timeout_ms, 5_000);
    }

    #[test]
    fn test_click_verify_parses() {
        let cfg: ClickConfig = serde_json::from_value(serde_json::json!({
            "index": 2,
            "verify": {"kind": "container_gone", "container": "xiaohongshu_detail.modal"}
        }))
        .unwrap();
        assert_eq!(
            cfg.verify,
            Some(ClickVerify::ContainerGone {
                container: "xiaohongshu_detail.modal".to_string()
            })
        );
    }

    #[test]
    fn test_scroll_config_accepts_distance_alias() {
        let cfg: ScrollConfig =
            serde_json::from_str(r#"{"direction": "down", "distance": 250.0}"#).unwrap();
        assert_eq!(cfg.amount, 250.0);
        assert_eq!(cfg.direction, ScrollDirection::Down);
    }
}
