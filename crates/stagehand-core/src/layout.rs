use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Filesystem layout rooted at the install path. Artifacts land wherever
/// their manifest item points; the layout only owns the pieces the
/// orchestrator itself writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    install_path: PathBuf,
}

impl InstallLayout {
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        Self {
            install_path: install_path.into(),
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// Cached copy of a remotely fetched manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.install_path.join("bootstrap.json")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.install_path)
            .with_context(|| format!("failed to create {}", self.install_path.display()))
    }
}
