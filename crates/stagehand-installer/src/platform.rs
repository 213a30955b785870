use std::path::Path;
use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};

/// Host-OS primitives the orchestrator depends on. Everything that shells
/// out to launchctl, pkgutil, or stat lives behind this trait so the rest of
/// the system can be exercised without a provisioned Mac.
pub trait Platform: Send + Sync {
    /// UID of the user owning the GUI console session.
    fn console_user_uid(&self) -> Result<u32>;

    /// Run a script in the console user's context, capturing combined
    /// output. Used by the single-process recovery flow where no agent
    /// exists to delegate to.
    fn run_as_console_user(&self, script: &Path) -> Result<Output>;

    /// Installed version recorded in the package receipt database, if any.
    /// `Some("")` means a receipt exists but carries no parseable version.
    fn package_receipt_version(&self, package_id: &str) -> Result<Option<String>>;

    /// Hand a path to the console user so the agent can operate on it.
    fn chown_to_uid(&self, path: &Path, uid: u32) -> Result<()>;

    /// Boot a launch service out of its domain. Missing services are fine.
    fn remove_service(&self, domain: &str, plist: &Path) -> Result<()>;

    /// Kick off a reboot; the caller decides how long to wait beforehand.
    fn schedule_reboot(&self) -> Result<()>;
}

pub struct MacPlatform;

impl Platform for MacPlatform {
    fn console_user_uid(&self) -> Result<u32> {
        let raw = run_capture(
            Command::new("stat").arg("-f").arg("%u").arg("/dev/console"),
            "failed to query console user",
        )?;
        raw.parse::<u32>()
            .with_context(|| format!("console user uid is not numeric: {raw}"))
    }

    fn run_as_console_user(&self, script: &Path) -> Result<Output> {
        let uid = self.console_user_uid()?;
        if uid == 0 {
            return Err(anyhow!("no user logged in; console is owned by root"));
        }

        let mut command = Command::new("launchctl");
        command.arg("asuser").arg(uid.to_string()).arg(script);
        if let Some(parent) = script.parent() {
            command.current_dir(parent);
        }
        command
            .output()
            .with_context(|| format!("failed to run {} as uid {uid}", script.display()))
    }

    fn package_receipt_version(&self, package_id: &str) -> Result<Option<String>> {
        let output = Command::new("pkgutil")
            .arg("--pkg-info")
            .arg(package_id)
            .output()
            .context("failed to run pkgutil")?;
        if !output.status.success() {
            // No receipt for this package id.
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix("version:"))
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        Ok(Some(version))
    }

    fn chown_to_uid(&self, path: &Path, uid: u32) -> Result<()> {
        std::os::unix::fs::chown(path, Some(uid), None)
            .with_context(|| format!("failed to chown {} to uid {uid}", path.display()))
    }

    fn remove_service(&self, domain: &str, plist: &Path) -> Result<()> {
        let mut command = Command::new("launchctl");
        command.arg("bootout").arg(domain).arg(plist);
        let output = command
            .output()
            .context("failed to run launchctl bootout")?;
        if !output.status.success() {
            return Err(anyhow!(
                "launchctl bootout {domain} {} failed: {}",
                plist.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }

    fn schedule_reboot(&self) -> Result<()> {
        Command::new("/sbin/shutdown")
            .arg("-r")
            .arg("now")
            .spawn()
            .context("failed to initiate reboot")?;
        Ok(())
    }
}

fn run_capture(command: &mut Command, context_message: &str) -> Result<String> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{context_message}: status={} stderr='{}'",
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
