use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Pending,
    Succeeded,
}

/// Tracks download destinations so failed or leftover artifacts can be
/// removed. Shared across the download worker pool.
pub struct CleanupTracker {
    files: Mutex<BTreeMap<PathBuf, FileState>>,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn track(&self, path: &Path) {
        self.files
            .lock()
            .expect("cleanup tracker poisoned")
            .insert(path.to_path_buf(), FileState::Pending);
    }

    pub fn mark_succeeded(&self, path: &Path) {
        self.files
            .lock()
            .expect("cleanup tracker poisoned")
            .insert(path.to_path_buf(), FileState::Succeeded);
    }

    pub fn pending_count(&self) -> usize {
        self.files
            .lock()
            .expect("cleanup tracker poisoned")
            .values()
            .filter(|state| **state == FileState::Pending)
            .count()
    }

    /// Remove destinations still pending (failure cleanup). Returns how many
    /// files were removed.
    pub fn cleanup(&self) -> usize {
        let files = self.files.lock().expect("cleanup tracker poisoned");
        let mut removed = 0;
        for (path, state) in files.iter() {
            if *state == FileState::Pending && remove_logged(path) {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every tracked destination regardless of state (success
    /// cleanup). Returns how many files were removed.
    pub fn cleanup_all(&self) -> usize {
        let files = self.files.lock().expect("cleanup tracker poisoned");
        let mut removed = 0;
        for path in files.keys() {
            if remove_logged(path) {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for CleanupTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_logged(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed tracked artifact");
            true
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove tracked artifact");
            false
        }
    }
}
