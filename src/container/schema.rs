//! Container library data model.
//!
//! Containers are pure data: a named region of a page with an ordered
//! selector strategy and a declared operation set. Behaviour lives in the
//! matcher and the operation executor, never in the container itself.

use serde::{Deserialize, Serialize};

/// The fixed operation vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationId {
    Click,
    Scroll,
    Highlight,
    Extract,
    Type,
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationId::Click => "click",
            OperationId::Scroll => "scroll",
            OperationId::Highlight => "highlight",
            OperationId::Extract => "extract",
            OperationId::Type => "type",
        };
        write!(f, "{}", s)
    }
}

/// One selector attempt. Variants are tried in declared order; the first
/// one yielding at least one (visible) element wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorVariant {
    /// "primary" or "fallback-N"
    pub variant: String,
    pub css: String,
    #[serde(default)]
    pub require_visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_text: Option<String>,
}

/// A field extracted from a matched container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractField {
    pub name: String,
    /// Inner selector relative to the matched element; the element itself
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Attribute to read; text content when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
}

/// A flattened container definition keyed by its dotted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDef {
    /// Dotted path, e.g. `xiaohongshu_search.search_result_item`
    pub id: String,
    /// Regex or glob patterns; required non-empty on roots, inherited by
    /// children for scoping.
    #[serde(default)]
    pub url_patterns: Vec<String>,
    pub selectors: Vec<SelectorVariant>,
    #[serde(default)]
    pub operations: Vec<OperationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract_fields: Vec<ExtractField>,
    /// Dotted path of the parent; None for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Checkpoint this container anchors, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl ContainerDef {
    pub fn root_id(&self) -> &str {
        self.id.split('.').next().unwrap_or(&self.id)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn depth(&self) -> usize {
        self.id.matches('.').count()
    }

    pub fn allows(&self, op: OperationId) -> bool {
        self.operations.contains(&op)
    }
}

/// On-disk shape: one file per root, children nested.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNode {
    /// Leaf segment for children, full id for the root.
    pub id: String,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub selectors: Vec<SelectorVariant>,
    #[serde(default)]
    pub operations: Vec<OperationId>,
    #[serde(default)]
    pub extract_fields: Vec<ExtractField>,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub children: Vec<ContainerNode>,
}

impl ContainerNode {
    /// Flatten the tree into definitions with full dotted ids and parent
    /// links, depth-first so parents precede children.
    pub fn flatten(&self) -> Vec<ContainerDef> {
        let mut out = Vec::new();
        self.flatten_into(None, &mut out);
        out
    }

    fn flatten_into(&self, parent: Option<&str>, out: &mut Vec<ContainerDef>) {
        let id = match parent {
            Some(p) => format!("{}.{}", p, self.id),
            None => self.id.clone(),
        };
        out.push(ContainerDef {
            id: id.clone(),
            url_patterns: self.url_patterns.clone(),
            selectors: self.selectors.clone(),
            operations: self.operations.clone(),
            extract_fields: self.extract_fields.clone(),
            parent: parent.map(|p| p.to_string()),
            checkpoint: self.checkpoint.clone(),
        });
        for child in &self.children {
            child.flatten_into(Some(&id), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_serde() {
        let ops: Vec<OperationId> =
            serde_json::from_str(r#"["click", "extract", "type"]"#).unwrap();
        assert_eq!(
            ops,
            vec![OperationId::Click, OperationId::Extract, OperationId::Type]
        );
        assert_eq!(serde_json::to_string(&OperationId::Highlight).unwrap(), "\"highlight\"");
    }

    #[test]
    fn test_flatten_assigns_dotted_ids() {
        let node: ContainerNode = serde_json::from_value(serde_json::json!({
            "id": "xiaohongshu_search",
            "urlPatterns": ["xiaohongshu\\.com/search_result"],
            "selectors": [{"variant": "primary", "css": "#search-root"}],
            "children": [
                {
                    "id": "search_result_item",
                    "selectors": [{"variant": "primary", "css": "section.note-item"}],
                    "operations": ["click", "extract"],
                    "children": [
                        {"id": "cover", "selectors": [{"variant": "primary", "css": "a.cover"}]}
                    ]
                }
            ]
        }))
        .unwrap();

        let defs = node.flatten();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].id, "xiaohongshu_search");
        assert!(defs[0].is_root());
        assert_eq!(defs[1].id, "xiaohongshu_search.search_result_item");
        assert_eq!(defs[1].parent.as_deref(), Some("xiaohongshu_search"));
        assert_eq!(defs[2].id, "xiaohongshu_search.search_result_item.cover");
        assert_eq!(defs[2].depth(), 2);
        assert_eq!(defs[2].root_id(), "xiaohongshu_search");
    }

    #[test]
    fn test_allows() {
        let def = ContainerDef {
            id: "a_b".into(),
            url_patterns: vec![],
            selectors: vec![],
            operations: vec![OperationId::Click],
            extract_fields: vec![],
            parent: None,
            checkpoint: None,
        };
        assert!(def.allows(OperationId::Click));
        assert!(!def.allows(OperationId::Type));
    }
}
