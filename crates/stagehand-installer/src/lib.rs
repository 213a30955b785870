use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

mod file;
mod package;
mod platform;
mod process;
mod script;

pub use file::{FileKind, FilePlacer};
pub use package::PackageInstaller;
pub use platform::{MacPlatform, Platform};
pub use process::ProcessTracker;
pub use script::{ExecMode, PreflightVerdict, ScriptRunner, ScriptStatus};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("script does not exist: {}", .0.display())]
    ScriptMissing(PathBuf),

    #[error("failed to start '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("script execution failed ({status}): {output}")]
    ExecFailed { status: String, output: String },

    #[error("package install failed ({status}): {output}")]
    InstallFailed { status: String, output: String },

    #[error("package receipt query failed: {0}")]
    ReceiptQuery(String),

    #[error("file does not exist: {}", .0.display())]
    FileMissing(PathBuf),

    #[error("failed to place {}: {source}", path.display())]
    PlaceFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("background process '{name}' failed: {detail}")]
    BackgroundFailed { name: String, detail: String },

    #[error("timed out waiting for background processes ({survivors} still running)")]
    BackgroundTimeout { survivors: usize },

    #[error("{0}")]
    Platform(String),
}

/// Facade combining script execution, package installation, and file
/// placement behind one dispatch surface.
pub struct SystemInstaller {
    scripts: ScriptRunner,
    packages: PackageInstaller,
    files: FilePlacer,
}

impl SystemInstaller {
    pub fn new(dry_run: bool, mode: ExecMode, platform: Arc<dyn Platform>) -> Self {
        Self {
            scripts: ScriptRunner::new(dry_run, mode, Arc::clone(&platform)),
            packages: PackageInstaller::new(dry_run, platform),
            files: FilePlacer::new(dry_run),
        }
    }

    pub fn install_package(&self, pkg_path: &Path, target: &str) -> Result<(), InstallerError> {
        self.packages.install(pkg_path, target)
    }

    pub fn receipt_satisfied(
        &self,
        package_id: Option<&str>,
        version: Option<&str>,
    ) -> Result<bool, InstallerError> {
        self.packages.receipt_satisfied(package_id, version)
    }

    pub fn run_script(
        &self,
        path: &Path,
        user_context: bool,
        do_not_wait: bool,
        track_background: bool,
    ) -> Result<ScriptStatus, InstallerError> {
        self.scripts
            .run_script(path, user_context, do_not_wait, track_background)
    }

    pub fn run_preflight_script(&self, path: &Path) -> Result<PreflightVerdict, InstallerError> {
        self.scripts.run_preflight_script(path)
    }

    pub fn place_file(&self, path: &Path, kind: FileKind) -> Result<(), InstallerError> {
        self.files.place(path, kind)
    }

    pub fn wait_for_background(&self, timeout: Duration) -> Vec<InstallerError> {
        self.scripts.wait_for_background(timeout)
    }

    pub fn background_count(&self) -> usize {
        self.scripts.background_count()
    }
}
