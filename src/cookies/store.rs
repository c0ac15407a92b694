//! Per-profile cookie persistence with stability windowing.
//!
//! Saves are atomic (temp + rename) so `load` never observes a partial
//! write, and a save only happens once the in-browser snapshot has been
//! unchanged for the stability window.

use crate::cookies::snapshot::{projection, Cookie};
use crate::error::{Result, WebautoError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// Outcome of a conditional save.
#[derive(Debug, Clone, Serialize)]
pub struct SaveOutcome {
    pub saved: bool,
    pub reason: &'static str,
}

struct StabilityState {
    /// Projection of the last observed snapshot.
    observed: Vec<String>,
    /// When the observed projection last changed.
    changed_at: Instant,
    /// Projection of the last snapshot written to disk.
    saved: Option<Vec<String>>,
}

pub struct CookieStore {
    dir: PathBuf,
    min_delay_ms: u64,
    stability: Mutex<HashMap<String, StabilityState>>,
}

impl CookieStore {
    pub fn new(dir: PathBuf, min_delay_ms: u64) -> Self {
        Self {
            dir,
            min_delay_ms,
            stability: Mutex::new(HashMap::new()),
        }
    }

    pub fn cookie_path(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", profile_id))
    }

    /// Load the persisted snapshot. A missing file is an empty snapshot.
    pub async fn load(&self, profile_id: &str) -> Result<Vec<Cookie>> {
        let path = self.cookie_path(profile_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unconditional atomic save. Rejects empty snapshots: a logged-out or
    /// half-loaded page must not clobber a good cookie file.
    pub async fn save(&self, profile_id: &str, cookies: &[Cookie]) -> Result<()> {
        if cookies.is_empty() {
            return Err(WebautoError::Validation(format!(
                "Refusing to save empty cookie snapshot for {}",
                profile_id
            )));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.cookie_path(profile_id);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(cookies)?;
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.stability
            .lock()
            .entry(profile_id.to_string())
            .and_modify(|s| s.saved = Some(projection(cookies)))
            .or_insert_with(|| StabilityState {
                observed: projection(cookies),
                changed_at: Instant::now(),
                saved: Some(projection(cookies)),
            });

        tracing::info!("Saved {} cookies for {}", cookies.len(), profile_id);
        Ok(())
    }

    /// Save bypassing the stability window. Audited.
    pub async fn force_save(&self, profile_id: &str, cookies: &[Cookie]) -> Result<()> {
        tracing::warn!(
            "Force-saving cookie snapshot for {} ({} cookies, stability window bypassed)",
            profile_id,
            cookies.len()
        );
        self.save(profile_id, cookies).await
    }

    /// Record the current in-browser snapshot and save it only when it has
    /// been unchanged for the stability window and differs from what's on
    /// disk. Returns why nothing was written otherwise.
    pub async fn save_if_stable(&self, profile_id: &str, cookies: &[Cookie]) -> Result<SaveOutcome> {
        if cookies.is_empty() {
            return Ok(SaveOutcome {
                saved: false,
                reason: "empty",
            });
        }

        let proj = projection(cookies);
        let now = Instant::now();

        let (stable, already_saved) = {
            let mut map = self.stability.lock();
            let state = map
                .entry(profile_id.to_string())
                .or_insert_with(|| StabilityState {
                    observed: proj.clone(),
                    changed_at: now,
                    saved: None,
                });

            if state.observed != proj {
                state.observed = proj.clone();
                state.changed_at = now;
                (false, false)
            } else {
                let elapsed = now.duration_since(state.changed_at).as_millis() as u64;
                (elapsed >= self.min_delay_ms, state.saved.as_ref() == Some(&proj))
            }
        };

        if !stable {
            return Ok(SaveOutcome {
                saved: false,
                reason: "unstable",
            });
        }
        if already_saved {
            return Ok(SaveOutcome {
                saved: false,
                reason: "unchanged",
            });
        }

        self.save(profile_id, cookies).await?;
        Ok(SaveOutcome {
            saved: true,
            reason: "stable",
        })
    }

    /// Drop stability tracking for a profile (session closed).
    pub fn forget(&self, profile_id: &str) {
        self.stability.lock().remove(profile_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::snapshot::equivalent;
    use tempfile::TempDir;

    fn cookie(name: &str, value: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: ".xiaohongshu.com".to_string(),
            path: "/".to_string(),
            expires: -1.0,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 0);
        let cookies = vec![cookie("web_session", "abc"), cookie("a1", "xyz")];

        store.save("xhs_fresh", &cookies).await.unwrap();
        let loaded = store.load("xhs_fresh").await.unwrap();
        assert!(equivalent(&cookies, &loaded));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 0);
        assert!(store.load("xhs_fresh").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_never_saved() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 0);

        assert!(store.save("xhs_fresh", &[]).await.is_err());
        let outcome = store.save_if_stable("xhs_fresh", &[]).await.unwrap();
        assert!(!outcome.saved);
        assert_eq!(outcome.reason, "empty");
        assert!(!store.cookie_path("xhs_fresh").exists());
    }

    #[tokio::test]
    async fn test_save_if_stable_waits_for_window() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 40);
        let cookies = vec![cookie("web_session", "abc")];

        // First observation starts the window; nothing is written yet.
        let o1 = store.save_if_stable("xhs_fresh", &cookies).await.unwrap();
        assert!(!o1.saved);
        assert_eq!(o1.reason, "unstable");

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let o2 = store.save_if_stable("xhs_fresh", &cookies).await.unwrap();
        assert!(o2.saved);

        // Same snapshot again: already on disk.
        let o3 = store.save_if_stable("xhs_fresh", &cookies).await.unwrap();
        assert!(!o3.saved);
        assert_eq!(o3.reason, "unchanged");
    }

    #[tokio::test]
    async fn test_change_resets_the_window() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 40);

        let first = vec![cookie("web_session", "abc")];
        let second = vec![cookie("web_session", "def")];

        store.save_if_stable("xhs_fresh", &first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        // A login redirect rotated the cookie: window restarts.
        let o = store.save_if_stable("xhs_fresh", &second).await.unwrap();
        assert!(!o.saved);
        assert_eq!(o.reason, "unstable");

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        let o = store.save_if_stable("xhs_fresh", &second).await.unwrap();
        assert!(o.saved);
    }

    #[tokio::test]
    async fn test_atomic_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = CookieStore::new(dir.path().to_path_buf(), 0);
        store
            .save("xhs_fresh", &[cookie("web_session", "abc")])
            .await
            .unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["xhs_fresh.json".to_string()]);
    }
}
