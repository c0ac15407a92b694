//! Checkpoint detection: classify the current page into a closed set of
//! named states by probing anchor containers.
//!
//! Hard-stop checkpoints (risk control, login guard, offsite) are
//! evaluated first and short-circuit; "ready" checkpoints come after.

use crate::container::matcher;
use crate::container::registry::ContainerRegistry;
use crate::error::{Result, WebautoError};
use crate::session::BrowserSession;
use serde::Serialize;

pub const CHECKPOINT_OFFSITE: &str = "offsite";
pub const CHECKPOINT_UNKNOWN: &str = "unknown";

/// Checkpoints that stop a workflow dead.
pub const HARD_STOPS: &[&str] = &["risk_control", "login_guard", CHECKPOINT_OFFSITE];

const PROBE_TIMEOUT_MS: u64 = 3_000;
const POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointProbe {
    pub checkpoint: String,
    pub container_ids: Vec<String>,
    pub hard_stop: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub checkpoint: String,
    pub url: String,
    pub matched_containers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureOptions {
    pub timeout_ms: u64,
    pub allow_one_level_up: bool,
}

pub struct CheckpointDetector {
    probes: Vec<CheckpointProbe>,
}

impl CheckpointDetector {
    /// Build the probe list from the library's checkpoint anchors. Anchors
    /// of the same checkpoint are AND-ed; hard stops go first.
    pub fn from_registry(registry: &ContainerRegistry) -> Self {
        let mut probes: Vec<CheckpointProbe> = Vec::new();
        for (checkpoint, container_id) in registry.checkpoint_anchors() {
            match probes.iter_mut().find(|p| p.checkpoint == checkpoint) {
                Some(probe) => probe.container_ids.push(container_id),
                None => probes.push(CheckpointProbe {
                    hard_stop: HARD_STOPS.contains(&checkpoint.as_str()),
                    checkpoint,
                    container_ids: vec![container_id],
                }),
            }
        }
        probes.sort_by_key(|p| !p.hard_stop);
        Self { probes }
    }

    pub fn probes(&self) -> &[CheckpointProbe] {
        &self.probes
    }

    /// Classify the current page. Offsite (no root container scopes the
    /// URL) is decided before any DOM probe runs.
    pub async fn detect(
        &self,
        session: &BrowserSession,
        registry: &ContainerRegistry,
    ) -> Result<Detection> {
        let url = session.url().await?;

        if registry.containers_for_url(&url).is_empty() && !registry.is_empty() {
            return Ok(Detection {
                checkpoint: CHECKPOINT_OFFSITE.to_string(),
                url,
                matched_containers: Vec::new(),
            });
        }

        for probe in &self.probes {
            let mut matched = Vec::with_capacity(probe.container_ids.len());
            let mut all = true;
            for container_id in &probe.container_ids {
                if self.probe_exists(session, registry, container_id).await? {
                    matched.push(container_id.clone());
                } else {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(Detection {
                    checkpoint: probe.checkpoint.clone(),
                    url,
                    matched_containers: matched,
                });
            }
        }

        Ok(Detection {
            checkpoint: CHECKPOINT_UNKNOWN.to_string(),
            url,
            matched_containers: Vec::new(),
        })
    }

    /// Probes bypass the URL-scope gate: a guard overlay counts wherever
    /// it appears.
    async fn probe_exists(
        &self,
        session: &BrowserSession,
        registry: &ContainerRegistry,
        container_id: &str,
    ) -> Result<bool> {
        let Some(def) = registry.get(container_id) else {
            return Ok(false);
        };
        match matcher::match_in_scope(session, def, PROBE_TIMEOUT_MS).await {
            Ok(results) => Ok(!results.is_empty()),
            Err(WebautoError::ContainerNoMatch(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Poll until the target checkpoint is reached, or fail with
    /// `CHECKPOINT_UNREACHABLE` at the deadline. Seeing a hard stop does
    /// not end the poll early: a guard page can still resolve within the
    /// window (cookie login landing, overlay dismissed by hand), and the
    /// last observed checkpoint is carried in the error either way.
    ///
    /// Idempotent once the target is reached: re-ensuring returns at the
    /// first poll.
    pub async fn ensure(
        &self,
        session: &BrowserSession,
        registry: &ContainerRegistry,
        target: &str,
        opts: EnsureOptions,
    ) -> Result<Detection> {
        self.ensure_inner(session, registry, target, opts, false).await
    }

    /// Workflow-facing variant of `ensure`: a detected hard-stop
    /// checkpoint other than the target fails immediately with the
    /// matching guard error. Plans treat guards as terminal; the raw
    /// `ensure` API above does not.
    pub async fn ensure_guarding(
        &self,
        session: &BrowserSession,
        registry: &ContainerRegistry,
        target: &str,
        opts: EnsureOptions,
    ) -> Result<Detection> {
        self.ensure_inner(session, registry, target, opts, true).await
    }

    async fn ensure_inner(
        &self,
        session: &BrowserSession,
        registry: &ContainerRegistry,
        target: &str,
        opts: EnsureOptions,
        guard_errors: bool,
    ) -> Result<Detection> {
        let timeout_ms = if opts.timeout_ms == 0 {
            10_000
        } else {
            opts.timeout_ms
        };
        let fallback = if opts.allow_one_level_up {
            self.one_level_up(registry, target)
        } else {
            None
        };

        let deadline =
            tokio::time::Instant::now() + tokio::time::Duration::from_millis(timeout_ms);

        loop {
            let detection = self.detect(session, registry).await?;

            if detection.checkpoint == target {
                return Ok(detection);
            }
            if let Some(fb) = &fallback {
                if &detection.checkpoint == fb {
                    tracing::info!(
                        "Checkpoint {} accepted as one-level-up fallback for {}",
                        fb,
                        target
                    );
                    return Ok(detection);
                }
            }

            if guard_errors {
                match detection.checkpoint.as_str() {
                    "risk_control" => {
                        return Err(WebautoError::RiskControlDetected(detection.url));
                    }
                    "login_guard" => {
                        return Err(WebautoError::LoginGuardDetected(detection.url));
                    }
                    _ => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(WebautoError::CheckpointUnreachable {
                    target: target.to_string(),
                    last: detection.checkpoint,
                });
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    /// The checkpoint anchored by the nearest ancestor of `target`'s
    /// anchor container that declares one.
    fn one_level_up(&self, registry: &ContainerRegistry, target: &str) -> Option<String> {
        let anchor_id = self
            .probes
            .iter()
            .find(|p| p.checkpoint == target)?
            .container_ids
            .first()?
            .clone();

        let mut current = registry.get(&anchor_id)?;
        while let Some(parent_id) = &current.parent {
            current = registry.get(parent_id)?;
            if let Some(checkpoint) = &current.checkpoint {
                if checkpoint != target {
                    return Some(checkpoint.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::schema::ContainerNode;
    use serde_json::json;

    fn registry() -> ContainerRegistry {
        let mut registry = ContainerRegistry::empty();
        registry
            .insert_tree(
                serde_json::from_value::<ContainerNode>(json!({
                    "id": "xiaohongshu_detail",
                    "urlPatterns": ["xiaohongshu\\.com/explore/"],
                    "selectors": [{"variant": "primary", "css": "#detail"}],
                    "checkpoint": "detail_ready",
                    "children": [{
                        "id": "comments",
                        "selectors": [{"variant": "primary", "css": ".comments-el"}],
                        "checkpoint": "comments_ready"
                    }]
                }))
                .unwrap(),
            )
            .unwrap();
        registry
            .insert_tree(
                serde_json::from_value::<ContainerNode>(json!({
                    "id": "xiaohongshu_login",
                    "urlPatterns": ["xiaohongshu\\.com"],
                    "selectors": [{"variant": "primary", "css": ".login-container"}],
                    "checkpoint": "login_guard",
                    "children": [{
                        "id": "qrcode_guard",
                        "selectors": [{"variant": "primary", "css": ".qrcode"}],
                        "checkpoint": "risk_control"
                    }]
                }))
                .unwrap(),
            )
            .unwrap();
        registry.validate().unwrap();
        registry
    }

    #[test]
    fn test_hard_stops_probe_first() {
        let registry = registry();
        let detector = CheckpointDetector::from_registry(&registry);
        let probes = detector.probes();

        let first_soft = probes.iter().position(|p| !p.hard_stop).unwrap();
        assert!(
            probes[..first_soft].iter().all(|p| p.hard_stop),
            "hard stops must precede ready checkpoints: {:?}",
            probes.iter().map(|p| &p.checkpoint).collect::<Vec<_>>()
        );
        assert!(probes.iter().any(|p| p.checkpoint == "risk_control"));
        assert!(probes.iter().any(|p| p.checkpoint == "detail_ready"));
    }

    #[test]
    fn test_one_level_up_walks_anchor_ancestry() {
        let registry = registry();
        let detector = CheckpointDetector::from_registry(&registry);
        assert_eq!(
            detector.one_level_up(&registry, "comments_ready"),
            Some("detail_ready".to_string())
        );
        assert_eq!(detector.one_level_up(&registry, "detail_ready"), None);
    }
}
