use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::{InstallerError, Platform, ProcessTracker};

/// Which identity this process runs under. The privileged driver must route
/// user scripts through the console-user wrapper; the agent runs them
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Privileged,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStatus {
    Completed,
    StartedTracked,
    StartedDetached,
}

/// Outcome of the preflight gate script: exit zero means provisioning is
/// already satisfied and the whole run short-circuits to cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightVerdict {
    Satisfied,
    Continue,
}

pub struct ScriptRunner {
    dry_run: bool,
    mode: ExecMode,
    tracker: ProcessTracker,
    platform: Arc<dyn Platform>,
}

impl ScriptRunner {
    pub fn new(dry_run: bool, mode: ExecMode, platform: Arc<dyn Platform>) -> Self {
        Self {
            dry_run,
            mode,
            tracker: ProcessTracker::new(),
            platform,
        }
    }

    pub fn run_script(
        &self,
        path: &Path,
        user_context: bool,
        do_not_wait: bool,
        track_background: bool,
    ) -> Result<ScriptStatus, InstallerError> {
        if self.dry_run {
            tracing::info!(script = %path.display(), "[dry run] would execute script");
            return Ok(ScriptStatus::Completed);
        }

        self.prepare(path)?;

        if user_context && self.mode == ExecMode::Privileged {
            tracing::debug!(script = %path.display(), "running user script via console-user wrapper");
            let output = self
                .platform
                .run_as_console_user(path)
                .map_err(|err| InstallerError::Platform(err.to_string()))?;
            return finish_foreground(path, output).map(|()| ScriptStatus::Completed);
        }

        let mut command = Command::new(path);
        if let Some(parent) = path.parent() {
            command.current_dir(parent);
        }

        if do_not_wait {
            let name = path.display().to_string();
            if track_background {
                self.tracker.spawn_tracked(command, &name)?;
                return Ok(ScriptStatus::StartedTracked);
            }
            command.stdout(Stdio::null()).stderr(Stdio::null());
            let child = command.spawn().map_err(|source| InstallerError::Spawn {
                name,
                source,
            })?;
            tracing::info!(script = %path.display(), pid = child.id(), "started script (fire-and-forget)");
            drop(child);
            return Ok(ScriptStatus::StartedDetached);
        }

        let output = command.output().map_err(|source| InstallerError::Spawn {
            name: path.display().to_string(),
            source,
        })?;
        finish_foreground(path, output).map(|()| ScriptStatus::Completed)
    }

    pub fn run_preflight_script(&self, path: &Path) -> Result<PreflightVerdict, InstallerError> {
        if self.dry_run {
            tracing::info!(script = %path.display(), "[dry run] would execute preflight script");
            return Ok(PreflightVerdict::Continue);
        }

        self.prepare(path)?;

        let mut command = Command::new(path);
        if let Some(parent) = path.parent() {
            command.current_dir(parent);
        }
        let output = command.output().map_err(|source| InstallerError::Spawn {
            name: path.display().to_string(),
            source,
        })?;

        let combined = combined_output(&output);
        if !combined.is_empty() {
            tracing::debug!(script = %path.display(), output = combined.as_str(), "preflight script output");
        }

        if output.status.success() {
            Ok(PreflightVerdict::Satisfied)
        } else {
            Ok(PreflightVerdict::Continue)
        }
    }

    pub fn wait_for_background(&self, timeout: Duration) -> Vec<InstallerError> {
        self.tracker.wait_all(timeout)
    }

    pub fn background_count(&self) -> usize {
        self.tracker.active_count()
    }

    fn prepare(&self, path: &Path) -> Result<(), InstallerError> {
        if !path.exists() {
            return Err(InstallerError::ScriptMissing(path.to_path_buf()));
        }

        let mut permissions = fs::metadata(path)
            .map_err(|source| InstallerError::Spawn {
                name: path.display().to_string(),
                source,
            })?
            .permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions).map_err(|source| InstallerError::Spawn {
            name: path.display().to_string(),
            source,
        })?;

        if let Some(interpreter) = sniff_interpreter(path) {
            tracing::debug!(script = %path.display(), interpreter = interpreter.as_str(), "detected interpreter");
        }
        Ok(())
    }
}

fn finish_foreground(path: &Path, output: Output) -> Result<(), InstallerError> {
    let combined = combined_output(&output);
    if output.status.success() {
        tracing::info!(script = %path.display(), "script executed");
        if !combined.is_empty() {
            tracing::debug!(script = %path.display(), output = combined.as_str(), "script output");
        }
        Ok(())
    } else {
        Err(InstallerError::ExecFailed {
            status: output.status.to_string(),
            output: combined,
        })
    }
}

fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr);
    }
    combined
}

/// Shebang peek, recorded for logging only; the script is always invoked
/// directly.
fn sniff_interpreter(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line).ok()?;
    let interpreter = first_line.trim().strip_prefix("#!")?;
    let binary = interpreter.split_whitespace().next()?;
    Some(
        Path::new(binary)
            .file_name()?
            .to_string_lossy()
            .to_string(),
    )
}
