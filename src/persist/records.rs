//! Append-only JSONL sinks and the like-dedup ledger.

use crate::error::Result;
use crate::persist::shard::fnv1a64;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const LINKS_FILE: &str = "phase2-links.jsonl";
pub const COMMENTS_FILE: &str = "comments.jsonl";
pub const LIKE_STATE_FILE: &str = ".like-state.jsonl";

/// One collected note link. Identity is `note_id`, the lowercase hex
/// prefix of the detail path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub note_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// URL of the list page the link was collected from.
    pub search_url: String,
    pub keyword: String,
    pub collected_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub note_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    #[serde(default)]
    pub like_count: u64,
    pub collected_at: u64,
}

/// Extract a note id from a detail URL (`/explore/<hex>` or
/// `/discovery/item/<hex>`).
pub fn note_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    for marker in ["/explore/", "/discovery/item/", "/item/"] {
        if let Some(pos) = path.find(marker) {
            let rest = &path[pos + marker.len()..];
            let id: String = rest
                .chars()
                .take_while(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
                .collect();
            if id.len() >= 8 {
                return Some(id);
            }
        }
    }
    None
}

/// Append one record to a JSONL file, creating parent directories.
pub async fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Read a whole JSONL file; malformed lines are skipped with a warning.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!("Skipping malformed JSONL line in {:?}: {}", path, e),
        }
    }
    Ok(out)
}

/// Dedup signature for a like/reply action. Text participates only up to
/// 200 chars so trailing edits don't defeat the dedup.
pub fn like_signature(note_id: &str, user_id: &str, user_name: &str, text: &str) -> String {
    let clipped: String = text.chars().take(200).collect();
    let key = format!("{}\u{1}{}\u{1}{}\u{1}{}", note_id, user_id, user_name, clipped);
    format!("{:016x}", fnv1a64(key.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LikeEntry {
    sig: String,
    ts: u64,
}

/// Persisted like signatures, loaded once per run and appended as actions
/// land. Survives resumes: a completed plan re-run produces zero new rows.
pub struct LikeLedger {
    path: PathBuf,
    seen: HashSet<String>,
}

impl LikeLedger {
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(LIKE_STATE_FILE);
        let entries: Vec<LikeEntry> = read_jsonl(&path).await?;
        Ok(Self {
            path,
            seen: entries.into_iter().map(|e| e.sig).collect(),
        })
    }

    pub fn contains(&self, sig: &str) -> bool {
        self.seen.contains(sig)
    }

    /// Record a signature. Returns false (and writes nothing) when it was
    /// already present.
    pub async fn record(&mut self, sig: &str) -> Result<bool> {
        if !self.seen.insert(sig.to_string()) {
            return Ok(false);
        }
        append_jsonl(
            &self.path,
            &LikeEntry {
                sig: sig.to_string(),
                ts: chrono::Utc::now().timestamp_millis() as u64,
            },
        )
        .await?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
