//! Adaptive snapshot persistence
//!
//! Snapshots survive crashes: written to a temp file in the target
//! directory, fsynced, then renamed over the destination. The reader
//! tolerates absence and version drift silently; a stale or mangled
//! snapshot only costs a longer cold start.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::adaptive::{AdaptiveRouter, AdaptiveSnapshot};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    saved_at: f64,
    snapshot: AdaptiveSnapshot,
}

/// Atomically write `snapshot` to `path` (`tmp + fsync + rename`).
pub fn save_snapshot(path: &Path, snapshot: &AdaptiveSnapshot) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let saved_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    let payload = serde_json::to_vec_pretty(&PersistedFile {
        saved_at,
        snapshot: snapshot.clone(),
    })?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new()?,
    };
    tmp.write_all(&payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a snapshot back. Returns None for a missing, unreadable or
/// structurally different file.
#[must_use]
pub fn load_snapshot(path: &Path) -> Option<AdaptiveSnapshot> {
    let text = std::fs::read_to_string(path).ok()?;
    // Accept both the wrapped form and a bare snapshot.
    if let Ok(file) = serde_json::from_str::<PersistedFile>(&text) {
        return Some(file.snapshot);
    }
    serde_json::from_str::<AdaptiveSnapshot>(&text).ok()
}

/// Interval- and lock-gated persistence driver. Writes are skipped when
/// another task holds the gate or the interval has not elapsed.
pub struct AdaptivePersistence {
    path: PathBuf,
    interval: Duration,
    gate: Mutex<()>,
    last_at: Mutex<Option<Instant>>,
}

impl AdaptivePersistence {
    #[must_use]
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            gate: Mutex::new(()),
            last_at: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load once at startup; logs on success.
    pub fn load_into(&self, router: &AdaptiveRouter) -> bool {
        match load_snapshot(&self.path) {
            Some(snap) => {
                let ok = router.load_snapshot(&snap);
                if ok {
                    info!("Adaptive snapshot loaded: {}", self.path.display());
                }
                ok
            }
            None => false,
        }
    }

    /// Possibly write a fresh snapshot. Returns true when a write
    /// happened. `force` bypasses the interval gate but not the lock.
    pub fn maybe_persist(&self, router: &AdaptiveRouter, force: bool) -> bool {
        if !force {
            let last = *self.last_at.lock();
            if let Some(last) = last {
                if last.elapsed() < self.interval {
                    return false;
                }
            }
        }
        let Some(_guard) = self.gate.try_lock() else {
            return false;
        };
        if !force {
            let last = *self.last_at.lock();
            if let Some(last) = last {
                if last.elapsed() < self.interval {
                    return false;
                }
            }
        }
        *self.last_at.lock() = Some(Instant::now());
        let snap = router.snapshot();
        match save_snapshot(&self.path, &snap) {
            Ok(()) => true,
            Err(e) => {
                warn!("Adaptive snapshot write failed ({}): {e}", self.path.display());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::adaptive::AdaptiveOptions;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adaptive.json");

        let router = AdaptiveRouter::new(vec!["a".to_string()], AdaptiveOptions::default());
        router.record_attempt("a", true, Some(0.2), Some(0.4));
        router.record_attempt("a", false, Some(0.3), None);
        let snap = router.snapshot();

        save_snapshot(&path, &snap).unwrap();
        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(load_snapshot(Path::new("/nonexistent/adaptive.json")).is_none());
    }

    #[test]
    fn test_load_garbage_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adaptive.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_snapshot(&path).is_none());
    }

    #[test]
    fn test_persistence_interval_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adaptive.json");
        let router = AdaptiveRouter::new(vec!["a".to_string()], AdaptiveOptions::default());
        let persist = AdaptivePersistence::new(path.clone(), Duration::from_secs(3600));

        assert!(persist.maybe_persist(&router, false));
        // Second write within the interval is skipped, force overrides.
        assert!(!persist.maybe_persist(&router, false));
        assert!(persist.maybe_persist(&router, true));
        assert!(path.exists());
    }
}
