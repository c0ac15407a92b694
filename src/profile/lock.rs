//! Process-wide exclusion for a profile directory.
//!
//! A profile may be driven by at most one browser process. The lock is a
//! pidfile inside the profile directory; a lock whose owner pid no longer
//! exists is stale and reclaimable.

use crate::error::{Result, WebautoError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, System};

const LOCK_FILE: &str = ".webauto-lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    profile_id: String,
    owner_pid: u32,
    acquired_at: u64,
}

/// Acquire the lock for `profile_id`, creating the profile directory if
/// needed. Fails with `PROFILE_BUSY` when an alive pid already holds it;
/// a stale lock (dead owner) is reclaimed silently.
pub fn acquire(profiles_root: &Path, profile_id: &str, owner_pid: u32) -> Result<()> {
    let dir = profiles_root.join(profile_id);
    fs::create_dir_all(&dir)?;
    let path = lock_path(&dir);

    if let Some(record) = read_lock(&path) {
        if pid_alive(record.owner_pid) {
            return Err(WebautoError::ProfileBusy {
                profile_id: profile_id.to_string(),
                owner_pid: record.owner_pid,
            });
        }
        tracing::warn!(
            "Reclaiming stale lock for {} (dead pid {})",
            profile_id,
            record.owner_pid
        );
    }

    let record = LockRecord {
        profile_id: profile_id.to_string(),
        owner_pid,
        acquired_at: chrono::Utc::now().timestamp_millis() as u64,
    };
    let text = serde_json::to_string(&record)?;
    fs::write(&path, text)?;
    tracing::info!("Acquired profile lock: {} (pid {})", profile_id, owner_pid);
    Ok(())
}

/// Release the lock. Idempotent: a missing lock file is not an error.
pub fn release(profiles_root: &Path, profile_id: &str) -> Result<()> {
    let path = lock_path(&profiles_root.join(profile_id));
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!("Released profile lock: {}", profile_id);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Current holder of the lock, if any (alive or stale).
pub fn holder(profiles_root: &Path, profile_id: &str) -> Option<u32> {
    read_lock(&lock_path(&profiles_root.join(profile_id))).map(|r| r.owner_pid)
}

fn lock_path(profile_dir: &Path) -> PathBuf {
    profile_dir.join(LOCK_FILE)
}

fn read_lock(path: &Path) -> Option<LockRecord> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// OS-level pid liveness check.
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let root = TempDir::new().unwrap();
        let pid = std::process::id();

        acquire(root.path(), "xhs_fresh", pid).unwrap();
        assert_eq!(holder(root.path(), "xhs_fresh"), Some(pid));

        release(root.path(), "xhs_fresh").unwrap();
        assert_eq!(holder(root.path(), "xhs_fresh"), None);
    }

    #[test]
    fn test_second_acquire_by_live_pid_is_busy() {
        let root = TempDir::new().unwrap();
        let pid = std::process::id();

        acquire(root.path(), "xhs_fresh", pid).unwrap();
        let err = acquire(root.path(), "xhs_fresh", pid).unwrap_err();
        assert_eq!(err.code(), "PROFILE_BUSY");
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let root = TempDir::new().unwrap();
        // Pid from a range no live process plausibly occupies in tests.
        acquire(root.path(), "xhs_fresh", u32::MAX - 7).unwrap();
        acquire(root.path(), "xhs_fresh", std::process::id()).unwrap();
        assert_eq!(holder(root.path(), "xhs_fresh"), Some(std::process::id()));
    }

    #[test]
    fn test_release_is_idempotent() {
        let root = TempDir::new().unwrap();
        release(root.path(), "never_locked").unwrap();
        release(root.path(), "never_locked").unwrap();
    }
}
