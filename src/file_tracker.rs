//! Deferred deletion of segment files.
//!
//! Compaction removes segments from the published snapshot before their
//! files can be unlinked: readers holding an older snapshot may still be
//! iterating them. The tracker bridges that gap with reference counting.
//! Snapshots hold [`FileGuard`]s for every segment file they reference; a
//! file handed to [`FileTracker::delete_files`] is unlinked as soon as its
//! last guard drops.
//!
//! The pending-delete set is persisted (atomic rewrite) so that a restart
//! finishes interrupted deletions instead of leaking files.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the tracker's persisted pending-delete file.
pub const TRACKER_STATE_FILE: &str = "pending_deletes";

#[derive(Default)]
struct TrackerInner {
    /// Live guard count per absolute path.
    refs: HashMap<String, usize>,
    /// Paths waiting for their reference count to reach zero.
    pending: BTreeSet<String>,
}

/// Process-wide deferred file deletion.
pub struct FileTracker {
    inner: Mutex<TrackerInner>,
    state_path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    pending: BTreeSet<String>,
}

impl FileTracker {
    /// Open the tracker, restoring any pending deletions recorded under
    /// `state_dir`, and immediately retry them.
    pub fn open(state_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(state_dir)?;
        let state_path = state_dir.join(TRACKER_STATE_FILE);

        let pending = match std::fs::read(&state_path) {
            Ok(raw) => bincode::deserialize::<PersistedState>(&raw)
                .map(|s| s.pending)
                .unwrap_or_default(),
            Err(_) => BTreeSet::new(),
        };

        let tracker = Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                refs: HashMap::new(),
                pending,
            }),
            state_path,
        });
        tracker.sweep()?;
        Ok(tracker)
    }

    /// Register a live reference to a file and return its guard. The
    /// returned guard is shared by every snapshot clone that embeds it;
    /// the reference drops when the last clone goes away.
    pub fn guard(self: &Arc<Self>, path: impl Into<String>) -> Arc<FileGuard> {
        let path = path.into();
        {
            let mut inner = self.inner.lock().unwrap();
            *inner.refs.entry(path.clone()).or_insert(0) += 1;
        }
        Arc::new(FileGuard {
            path,
            tracker: self.clone(),
        })
    }

    /// Mark a set of paths for deletion. Unreferenced paths are unlinked
    /// immediately; the rest wait for their guards.
    pub fn delete_files(&self, paths: HashSet<String>) -> Result<()> {
        let unlink_now: Vec<String> = {
            let mut inner = self.inner.lock().unwrap();
            for path in paths {
                inner.pending.insert(path);
            }
            self.persist(&inner)?;
            inner
                .pending
                .iter()
                .filter(|p| inner.refs.get(*p).copied().unwrap_or(0) == 0)
                .cloned()
                .collect()
        };
        self.unlink(&unlink_now)
    }

    /// Retry pending deletions whose references have drained.
    pub fn sweep(&self) -> Result<usize> {
        let unlink_now: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .pending
                .iter()
                .filter(|p| inner.refs.get(*p).copied().unwrap_or(0) == 0)
                .cloned()
                .collect()
        };
        let count = unlink_now.len();
        self.unlink(&unlink_now)?;
        Ok(count)
    }

    /// Number of paths still waiting for deletion.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    fn release(&self, path: &str) {
        let unlink_now: Option<String> = {
            let mut inner = self.inner.lock().unwrap();
            match inner.refs.get_mut(path) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(_) => {
                    inner.refs.remove(path);
                    inner.pending.contains(path).then(|| path.to_string())
                }
                None => None,
            }
        };
        if let Some(path) = unlink_now {
            if let Err(e) = self.unlink(&[path.clone()]) {
                tracing::warn!(path = %path, error = %e, "deferred file deletion failed");
            }
        }
    }

    fn unlink(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    inner.pending.remove(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Already gone; the restart sweep hits this for files a
                    // previous process deleted before persisting.
                    inner.pending.remove(path);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to delete file, keeping pending");
                }
            }
        }
        self.persist(&inner)
    }

    fn persist(&self, inner: &TrackerInner) -> Result<()> {
        let state = PersistedState {
            pending: inner.pending.clone(),
        };
        let body = bincode::serialize(&state)?;
        let tmp = self.state_path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

/// A live reference to a tracked file. Embedded in snapshots; dropping the
/// last clone releases the reference and may complete a pending deletion.
pub struct FileGuard {
    path: String,
    tracker: Arc<FileTracker>,
}

impl FileGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for FileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGuard").field("path", &self.path).finish()
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.path);
    }
}
