//! In-memory action log: records every controller action with timing and
//! outcome. Entries are also appended to daily JSONL files under
//! ~/.webauto/logs/.

use crate::config::schema::webauto_home;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

const MAX_ENTRIES: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: String,         // uuid v4
    pub ts: u64,            // Unix ms
    pub profile_id: String, // empty string when not profile-scoped
    pub action: String,     // e.g. "browser:goto", "container:operation"
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ActionLog {
    buffer: Arc<Mutex<VecDeque<ActionEntry>>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_ENTRIES))),
        }
    }

    pub fn push(&self, entry: ActionEntry) {
        let mut buf = self.buffer.lock();
        if buf.len() >= MAX_ENTRIES {
            buf.pop_front();
        }
        buf.push_back(entry);
    }

    /// Return entries filtered by optional profile_id, newest-first, up to `limit`.
    pub fn get_filtered(&self, profile_id: Option<&str>, limit: usize) -> Vec<ActionEntry> {
        let buf = self.buffer.lock();
        buf.iter()
            .rev()
            .filter(|e| profile_id.map(|id| e.profile_id == id).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn clear(&self, profile_id: Option<&str>) {
        let mut buf = self.buffer.lock();
        match profile_id {
            Some(id) => buf.retain(|e| e.profile_id != id),
            None => buf.clear(),
        }
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one entry to the daily log file asynchronously (fire-and-forget).
pub fn append_to_file(entry: &ActionEntry) {
    let date = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(entry.ts as i64)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string();

    let log_dir = webauto_home().join("logs");

    let line = match serde_json::to_string(entry) {
        Ok(s) => s + "\n",
        Err(_) => return,
    };

    tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            tracing::warn!("Failed to create log dir: {}", e);
            return;
        }
        let path = log_dir.join(format!("{}.jsonl", date));
        use tokio::io::AsyncWriteExt;
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(mut f) => {
                let _ = f.write_all(line.as_bytes()).await;
            }
            Err(e) => tracing::warn!("Failed to write action log: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(profile_id: &str, action: &str) -> ActionEntry {
        ActionEntry {
            id: uuid::Uuid::new_v4().to_string(),
            ts: 1,
            profile_id: profile_id.to_string(),
            action: action.to_string(),
            duration_ms: 5,
            success: true,
            error: None,
        }
    }

    #[test]
    fn test_push_and_filter() {
        let log = ActionLog::new();
        log.push(entry("xhs_fresh", "browser:goto"));
        log.push(entry("weibo_main", "session:create"));
        log.push(entry("xhs_fresh", "container:operation"));

        let all = log.get_filtered(None, 10);
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].action, "container:operation");

        let xhs = log.get_filtered(Some("xhs_fresh"), 10);
        assert_eq!(xhs.len(), 2);
    }

    #[test]
    fn test_buffer_caps() {
        let log = ActionLog::new();
        for i in 0..(MAX_ENTRIES + 10) {
            log.push(entry("xhs_fresh", &format!("a{}", i)));
        }
        assert_eq!(log.get_filtered(None, usize::MAX).len(), MAX_ENTRIES);
    }

    #[test]
    fn test_clear_scoped() {
        let log = ActionLog::new();
        log.push(entry("xhs_fresh", "a"));
        log.push(entry("weibo_main", "b"));
        log.clear(Some("xhs_fresh"));
        let rest = log.get_filtered(None, 10);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].profile_id, "weibo_main");
    }
}
