//! Background cookie autosave, one task per profile at most.

use crate::cookies::snapshot::Cookie;
use crate::cookies::store::CookieStore;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Autosaver {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Autosaver {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the autosave loop for a profile. `fetch` reads the current
    /// in-browser snapshot. A prior task for the same profile is replaced.
    /// Save failures are retried on the next tick and never propagate.
    pub fn start<F, Fut>(
        &self,
        profile_id: &str,
        interval_ms: u64,
        store: Arc<CookieStore>,
        fetch: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<Cookie>>> + Send + 'static,
    {
        let id = profile_id.to_string();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_millis(interval_ms.max(500)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let cookies = match fetch().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!("Cookie fetch failed for {}: {}", task_id, e);
                        continue;
                    }
                };
                match store.save_if_stable(&task_id, &cookies).await {
                    Ok(outcome) if outcome.saved => {
                        tracing::debug!("Autosaved cookies for {}", task_id);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Cookie autosave failed for {}: {}", task_id, e),
                }
            }
        });

        if let Some(old) = self.tasks.lock().insert(id.clone(), handle) {
            old.abort();
            tracing::debug!("Replaced autosave task for {}", id);
        }
        tracing::info!("Cookie autosave started for {} ({}ms)", id, interval_ms);
    }

    /// Stop the autosave loop for a profile. No-op when none is running.
    pub fn stop(&self, profile_id: &str) {
        if let Some(handle) = self.tasks.lock().remove(profile_id) {
            handle.abort();
            tracing::info!("Cookie autosave stopped for {}", profile_id);
        }
    }

    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    pub fn is_running(&self, profile_id: &str) -> bool {
        self.tasks.lock().contains_key(profile_id)
    }
}

impl Default for Autosaver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cookie(name: &str, value: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: String::new(),
            path: "/".to_string(),
            expires: -1.0,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    #[tokio::test]
    async fn test_at_most_one_task_per_profile() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CookieStore::new(dir.path().to_path_buf(), 0));
        let autosaver = Autosaver::new();

        autosaver.start("xhs_fresh", 10_000, Arc::clone(&store), || async {
            Ok(vec![cookie("a", "1")])
        });
        autosaver.start("xhs_fresh", 10_000, Arc::clone(&store), || async {
            Ok(vec![cookie("a", "2")])
        });

        assert!(autosaver.is_running("xhs_fresh"));
        assert_eq!(autosaver.tasks.lock().len(), 1);

        autosaver.stop("xhs_fresh");
        assert!(!autosaver.is_running("xhs_fresh"));
    }

    #[tokio::test]
    async fn test_stop_unknown_profile_is_noop() {
        let autosaver = Autosaver::new();
        autosaver.stop("never_started");
    }
}
