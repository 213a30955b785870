use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use crate::{InstallerError, Platform};

fn combined(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
    }
    text
}

/// Drives the host installer tool for package artifacts.
pub struct PackageInstaller {
    dry_run: bool,
    platform: Arc<dyn Platform>,
}

impl PackageInstaller {
    pub fn new(dry_run: bool, platform: Arc<dyn Platform>) -> Self {
        Self { dry_run, platform }
    }

    pub fn install(&self, pkg_path: &Path, target: &str) -> Result<(), InstallerError> {
        let target = if target.is_empty() { "/" } else { target };
        tracing::info!(package = %pkg_path.display(), target, "installing package");

        if self.dry_run {
            tracing::info!(package = %pkg_path.display(), "[dry run] would install package");
            return Ok(());
        }

        let output = Command::new("installer")
            .arg("-pkg")
            .arg(pkg_path)
            .arg("-target")
            .arg(target)
            .output()
            .map_err(|source| InstallerError::Spawn {
                name: format!("installer -pkg {}", pkg_path.display()),
                source,
            })?;

        if !output.status.success() {
            return Err(InstallerError::InstallFailed {
                status: output.status.to_string(),
                output: combined(&output),
            });
        }

        tracing::info!(package = %pkg_path.display(), "package installed");
        Ok(())
    }

    /// True when the receipt database already satisfies the item and the
    /// install can be skipped. An item without a package id has nothing to
    /// compare and counts as satisfied.
    pub fn receipt_satisfied(
        &self,
        package_id: Option<&str>,
        version: Option<&str>,
    ) -> Result<bool, InstallerError> {
        let Some(package_id) = package_id.filter(|id| !id.is_empty()) else {
            tracing::debug!("no package id provided, skipping receipt check");
            return Ok(true);
        };

        let installed = self
            .platform
            .package_receipt_version(package_id)
            .map_err(|err| InstallerError::ReceiptQuery(err.to_string()))?;

        let Some(installed_version) = installed else {
            tracing::debug!(package_id, "no receipt found");
            return Ok(false);
        };

        match version.filter(|v| !v.is_empty()) {
            None => Ok(true),
            // A receipt with no parseable version cannot contradict the
            // requested one; treat it as satisfied.
            Some(_) if installed_version.is_empty() => Ok(true),
            Some(required) => {
                let matches = installed_version == required;
                tracing::debug!(
                    package_id,
                    installed = installed_version.as_str(),
                    required,
                    matches,
                    "receipt version comparison"
                );
                Ok(matches)
            }
        }
    }
}
