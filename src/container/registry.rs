//! Container library: load, validate, and answer URL-scope queries.
//!
//! The library is a directory of JSON files, one root-container tree per
//! file. Loads produce an immutable registry; reloads swap the whole
//! registry atomically behind the shared handle.

use crate::container::schema::{ContainerDef, ContainerNode};
use crate::error::{Result, WebautoError};
use std::collections::HashMap;
use std::path::Path;

pub struct ContainerRegistry {
    containers: HashMap<String, ContainerDef>,
    /// Root ids in load order.
    roots: Vec<String>,
}

impl ContainerRegistry {
    pub fn empty() -> Self {
        Self {
            containers: HashMap::new(),
            roots: Vec::new(),
        }
    }

    /// Load every `*.json` tree in the library directory. A missing
    /// directory yields an empty registry (the service can run before any
    /// library is authored).
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        if !dir.exists() {
            tracing::warn!("Container library {:?} does not exist, starting empty", dir);
            return Ok(registry);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)?;
            let node: ContainerNode = serde_json::from_str(&text).map_err(|e| {
                WebautoError::Validation(format!("Container file {:?}: {}", path, e))
            })?;
            registry.insert_tree(node)?;
        }

        registry.validate()?;
        tracing::info!(
            "Container library loaded: {} roots, {} containers",
            registry.roots.len(),
            registry.containers.len()
        );
        Ok(registry)
    }

    /// Insert one root tree. Used by `load_dir` and by tests that build
    /// registries inline.
    pub fn insert_tree(&mut self, node: ContainerNode) -> Result<()> {
        let defs = node.flatten();
        let root_id = defs[0].id.clone();
        if self.containers.contains_key(&root_id) {
            return Err(WebautoError::Validation(format!(
                "Duplicate root container: {}",
                root_id
            )));
        }
        self.roots.push(root_id);
        for def in defs {
            if self.containers.insert(def.id.clone(), def).is_some() {
                return Err(WebautoError::Validation(
                    "Duplicate container id in tree".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Structural validation of the whole library.
    pub fn validate(&self) -> Result<()> {
        for id in &self.roots {
            let root = &self.containers[id];
            if root.url_patterns.is_empty() {
                return Err(WebautoError::Validation(format!(
                    "Root container {} has no urlPatterns",
                    id
                )));
            }
        }

        for def in self.containers.values() {
            if let Some(parent) = &def.parent {
                let parent_def = self.containers.get(parent).ok_or_else(|| {
                    WebautoError::Validation(format!(
                        "Container {} has unknown parent {}",
                        def.id, parent
                    ))
                })?;
                if parent_def.root_id() != def.root_id() {
                    return Err(WebautoError::Validation(format!(
                        "Container {} has cross-root parent {}",
                        def.id, parent
                    )));
                }
            }

            if def.selectors.is_empty() {
                return Err(WebautoError::Validation(format!(
                    "Container {} has no selectors",
                    def.id
                )));
            }
            for sel in &def.selectors {
                let label_ok = sel.variant == "primary"
                    || (sel.variant.starts_with("fallback-")
                        && sel.variant["fallback-".len()..]
                            .chars()
                            .all(|c| c.is_ascii_digit())
                        && sel.variant.len() > "fallback-".len());
                if !label_ok {
                    return Err(WebautoError::Validation(format!(
                        "Container {} selector has invalid variant label '{}'",
                        def.id, sel.variant
                    )));
                }
            }
            if !def.selectors.iter().any(|s| s.variant == "primary") {
                return Err(WebautoError::Validation(format!(
                    "Container {} has no primary selector",
                    def.id
                )));
            }
        }

        // Two roots sharing a literal pattern must be in a specialization
        // relationship (one id extends the other), otherwise dispatch by
        // URL would be ambiguous.
        for (i, a) in self.roots.iter().enumerate() {
            for b in self.roots.iter().skip(i + 1) {
                let da = &self.containers[a];
                let db = &self.containers[b];
                let shares = da
                    .url_patterns
                    .iter()
                    .any(|p| db.url_patterns.contains(p));
                if shares {
                    let specializes = a.starts_with(&format!("{}_", b))
                        || b.starts_with(&format!("{}_", a));
                    if !specializes {
                        return Err(WebautoError::Validation(format!(
                            "Root containers {} and {} match the same URL pattern",
                            a, b
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ContainerDef> {
        self.containers.get(id)
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerDef> {
        self.containers.values()
    }

    /// Whether a container's root scope covers the URL.
    pub fn in_scope(&self, container_id: &str, url: &str) -> bool {
        let root_id = container_id.split('.').next().unwrap_or(container_id);
        self.containers
            .get(root_id)
            .map(|root| url_matches_any(&root.url_patterns, url))
            .unwrap_or(false)
    }

    /// Containers applicable to the URL, roots first, then by depth and id
    /// for a deterministic probe order.
    pub fn containers_for_url(&self, url: &str) -> Vec<&ContainerDef> {
        let mut out: Vec<&ContainerDef> = Vec::new();
        for root_id in &self.roots {
            let root = &self.containers[root_id];
            if !url_matches_any(&root.url_patterns, url) {
                continue;
            }
            let prefix = format!("{}.", root_id);
            let mut members: Vec<&ContainerDef> = self
                .containers
                .values()
                .filter(|d| d.id == *root_id || d.id.starts_with(&prefix))
                .collect();
            members.sort_by(|a, b| a.depth().cmp(&b.depth()).then(a.id.cmp(&b.id)));
            out.extend(members);
        }
        out
    }

    /// Checkpoint anchors declared in the library, in probe order.
    pub fn checkpoint_anchors(&self) -> Vec<(String, String)> {
        let mut anchors: Vec<(String, String)> = Vec::new();
        for root_id in &self.roots {
            let prefix = format!("{}.", root_id);
            let mut members: Vec<&ContainerDef> = self
                .containers
                .values()
                .filter(|d| d.id == *root_id || d.id.starts_with(&prefix))
                .filter(|d| d.checkpoint.is_some())
                .collect();
            members.sort_by(|a, b| a.depth().cmp(&b.depth()).then(a.id.cmp(&b.id)));
            for def in members {
                if let Some(checkpoint) = &def.checkpoint {
                    anchors.push((checkpoint.clone(), def.id.clone()));
                }
            }
        }
        anchors
    }
}

/// Match a URL against a pattern list. Patterns are regexes; a pattern
/// that fails to compile is retried as a glob (`*` wildcards).
pub fn url_matches_any(patterns: &[String], url: &str) -> bool {
    patterns.iter().any(|p| url_matches(p, url))
}

fn url_matches(pattern: &str, url: &str) -> bool {
    if let Ok(re) = regex::Regex::new(pattern) {
        return re.is_match(url);
    }
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&escaped)
        .map(|re| re.is_match(url))
        .unwrap_or(false)
}
