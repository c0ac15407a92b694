//! Resumable per-keyword run state (`.collect-state.json`).

use crate::error::Result;
use crate::persist::shard::ShardSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const COLLECT_STATE_FILE: &str = ".collect-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCollection {
    #[serde(default)]
    pub target_count: u64,
    #[serde(default)]
    pub collected_note_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectState {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub resume: ResumeState,
    #[serde(default)]
    pub list_collection: ListCollection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,
}

impl CollectState {
    pub fn record_note(&mut self, note_id: &str) -> bool {
        if self
            .list_collection
            .collected_note_ids
            .iter()
            .any(|id| id == note_id)
        {
            return false;
        }
        self.list_collection
            .collected_note_ids
            .push(note_id.to_string());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
            || (self.list_collection.target_count > 0
                && self.list_collection.collected_note_ids.len() as u64
                    >= self.list_collection.target_count)
    }
}

/// Keyword directory layout: `<root>/<platform>/<env>/<keyword>/`.
pub fn keyword_dir(root: &Path, platform: &str, env: &str, keyword: &str) -> PathBuf {
    root.join(platform).join(env).join(keyword)
}

/// Load the run state for a keyword directory; absent file is a fresh state.
pub async fn load_state(dir: &Path) -> Result<CollectState> {
    let path = dir.join(COLLECT_STATE_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CollectState::default()),
        Err(e) => Err(e.into()),
    }
}

/// Save atomically (temp + rename) so readers only see committed states.
pub async fn save_state(dir: &Path, state: &CollectState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(COLLECT_STATE_FILE);
    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::shard::ShardBy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let kw = keyword_dir(dir.path(), "xiaohongshu", "prod", "红茶");

        let mut state = CollectState::default();
        state.status = RunStatus::Running;
        state.resume.last_step = Some("phase2_collect".to_string());
        state.list_collection.target_count = 50;
        state.record_note("65f2a8b900000000aaaa1111");
        state.shard = Some(ShardSpec {
            index: 2,
            count: 4,
            by: ShardBy::NoteIdHash,
        });

        save_state(&kw, &state).await.unwrap();
        let loaded = load_state(&kw).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.resume.last_step.as_deref(), Some("phase2_collect"));
        assert_eq!(loaded.list_collection.collected_note_ids.len(), 1);
        assert_eq!(loaded.shard.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_missing_state_is_fresh() {
        let dir = TempDir::new().unwrap();
        let state = load_state(dir.path()).await.unwrap();
        assert_eq!(state.status, RunStatus::Pending);
        assert!(state.list_collection.collected_note_ids.is_empty());
    }

    #[test]
    fn test_record_note_dedups() {
        let mut state = CollectState::default();
        assert!(state.record_note("a"));
        assert!(!state.record_note("a"));
        assert_eq!(state.list_collection.collected_note_ids.len(), 1);
    }

    #[test]
    fn test_completion_by_target() {
        let mut state = CollectState::default();
        state.list_collection.target_count = 2;
        state.record_note("a");
        assert!(!state.is_complete());
        state.record_note("b");
        assert!(state.is_complete());
    }
}
