use stagehand_core::{Item, ItemType, Phase, Settings};
use stagehand_download::{Client, CleanupTracker, DownloadError, FetchRequest};
use stagehand_installer::{FileKind, InstallerError, PreflightVerdict, SystemInstaller};
use thiserror::Error;

mod arch;
mod policy;

pub use arch::{detect, should_skip, HostArch};
pub use policy::{evaluate, FailDecision, Operation};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("item '{item}' is not allowed in the {} phase", phase.as_str())]
    DisallowedItem { phase: Phase, item: String },

    #[error("failed to download {failed} items in the {} phase: {source}", phase.as_str())]
    DownloadFailed {
        phase: Phase,
        failed: usize,
        #[source]
        source: DownloadError,
    },

    #[error("{} failed for '{item}' in the {} phase: {source}", operation.as_str(), phase.as_str())]
    ItemFailed {
        phase: Phase,
        item: String,
        operation: Operation,
        #[source]
        source: InstallerError,
    },

    #[error("background processes failed in the {} phase: {failures} errors", phase.as_str())]
    BackgroundDrain { phase: Phase, failures: usize },
}

/// How a phase ended. Preflight may end the entire run early when its gate
/// script reports the host as already provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRun {
    Completed,
    PreflightSatisfied,
}

/// Drives one manifest phase to completion: restriction check, architecture
/// filter, bounded pre-download, strictly ordered dispatch, fail-policy
/// evaluation, and the per-phase background drain. One engine instance keeps
/// a single cleanup tracker across every phase it processes.
pub struct PhaseEngine<'a> {
    downloader: &'a Client,
    installer: &'a SystemInstaller,
    settings: &'a Settings,
    host_arch: HostArch,
    tracker: CleanupTracker,
}

impl<'a> PhaseEngine<'a> {
    pub fn new(
        downloader: &'a Client,
        installer: &'a SystemInstaller,
        settings: &'a Settings,
    ) -> Self {
        Self::with_host_arch(downloader, installer, settings, arch::detect())
    }

    pub fn with_host_arch(
        downloader: &'a Client,
        installer: &'a SystemInstaller,
        settings: &'a Settings,
        host_arch: HostArch,
    ) -> Self {
        Self {
            downloader,
            installer,
            settings,
            host_arch,
            tracker: CleanupTracker::new(),
        }
    }

    /// Remove every artifact tracked so far, regardless of phase outcome.
    pub fn cleanup_tracked(&self) -> usize {
        self.tracker.cleanup_all()
    }

    pub fn process(&self, items: &[Item], phase: Phase) -> Result<PhaseRun, PhaseError> {
        if items.is_empty() {
            return Ok(PhaseRun::Completed);
        }

        for item in items {
            if phase.is_root_only() && item.item_type.is_user_context() {
                return Err(PhaseError::DisallowedItem {
                    phase,
                    item: item.name.clone(),
                });
            }
        }

        tracing::info!(phase = phase.as_str(), total = items.len(), "processing phase");

        let filtered: Vec<&Item> = items
            .iter()
            .filter(|item| {
                if arch::should_skip(item.skip_if, self.host_arch) {
                    tracing::info!(
                        item = item.name.as_str(),
                        skip_if = item.skip_if.map(|s| s.as_str()).unwrap_or(""),
                        "skipping item for this architecture"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        if filtered.is_empty() {
            tracing::info!(phase = phase.as_str(), "no items left after filtering");
            return Ok(PhaseRun::Completed);
        }

        self.download_phase_items(&filtered, phase)?;

        for (index, item) in filtered.iter().enumerate() {
            tracing::info!(
                phase = phase.as_str(),
                item = item.name.as_str(),
                kind = item.item_type.as_str(),
                position = format!("{}/{}", index + 1, filtered.len()),
                "dispatching item"
            );
            match self.dispatch(item, phase)? {
                PhaseRun::Completed => {}
                PhaseRun::PreflightSatisfied => return Ok(PhaseRun::PreflightSatisfied),
            }
        }

        self.drain_background(phase)?;

        tracing::info!(phase = phase.as_str(), "phase completed");

        if self.settings.cleanup_on_success {
            let removed = self.tracker.cleanup_all();
            tracing::debug!(phase = phase.as_str(), removed, "cleaned up downloaded artifacts");
        }
        Ok(PhaseRun::Completed)
    }

    fn download_phase_items(&self, filtered: &[&Item], phase: Phase) -> Result<(), PhaseError> {
        for item in filtered {
            self.tracker.track(&item.file);
        }

        let requests: Vec<FetchRequest> = filtered
            .iter()
            .map(|item| FetchRequest {
                name: item.name.clone(),
                url: item.url.clone(),
                destination: item.file.clone(),
                expected_hash: item.hash.clone(),
                retries: item.retries,
                retry_wait: std::time::Duration::from_secs(item.retry_wait),
            })
            .collect();

        let results = self.downloader.fetch_many(
            &requests,
            self.settings.download_max_concurrency,
            self.settings.cleanup_failed_downloads(),
        );

        let mut first_error = None;
        let mut failed = 0;
        for (item, result) in filtered.iter().zip(results) {
            match result {
                Ok(()) => {
                    tracing::debug!(item = item.name.as_str(), "download ok");
                }
                Err(err) => {
                    tracing::error!(item = item.name.as_str(), error = %err, "download failed");
                    failed += 1;
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(source) => Err(PhaseError::DownloadFailed {
                phase,
                failed,
                source,
            }),
        }
    }

    fn dispatch(&self, item: &Item, phase: Phase) -> Result<PhaseRun, PhaseError> {
        match item.item_type {
            ItemType::Package => {
                if item.pkg_required {
                    match self.installer.receipt_satisfied(
                        item.packageid.as_deref(),
                        item.version.as_deref(),
                    ) {
                        Ok(true) => {
                            tracing::info!(item = item.name.as_str(), "package already installed, skipping");
                            return Ok(PhaseRun::Completed);
                        }
                        Ok(false) => {}
                        Err(err) => {
                            self.handle_item_error(item, phase, Operation::ReceiptCheck, err)?;
                            return Ok(PhaseRun::Completed);
                        }
                    }
                }
                if let Err(err) = self.installer.install_package(&item.file, "/") {
                    self.handle_item_error(item, phase, Operation::PackageInstall, err)?;
                }
            }
            ItemType::RootScript if phase == Phase::Preflight => {
                match self.installer.run_preflight_script(&item.file) {
                    Ok(PreflightVerdict::Satisfied) => {
                        tracing::info!(
                            item = item.name.as_str(),
                            "preflight gate reports provisioning satisfied"
                        );
                        if self.settings.cleanup_on_success || self.settings.cleanup_on_failure {
                            self.tracker.cleanup_all();
                        }
                        return Ok(PhaseRun::PreflightSatisfied);
                    }
                    Ok(PreflightVerdict::Continue) => {
                        tracing::info!(
                            item = item.name.as_str(),
                            "preflight gate requests full bootstrap"
                        );
                    }
                    // The preflight gate ignores fail policy; a script that
                    // cannot run at all ends the phase.
                    Err(err) => {
                        return Err(PhaseError::ItemFailed {
                            phase,
                            item: item.name.clone(),
                            operation: Operation::ScriptExecution,
                            source: err,
                        });
                    }
                }
            }
            ItemType::RootScript | ItemType::UserScript => {
                let user_context = item.item_type == ItemType::UserScript;
                if let Err(err) = self.installer.run_script(
                    &item.file,
                    user_context,
                    item.donotwait,
                    self.settings.track_background_processes,
                ) {
                    self.handle_item_error(item, phase, Operation::ScriptExecution, err)?;
                }
            }
            ItemType::RootFile | ItemType::UserFile => {
                let kind = if item.item_type == ItemType::RootFile {
                    FileKind::Root
                } else {
                    FileKind::User
                };
                if let Err(err) = self.installer.place_file(&item.file, kind) {
                    self.handle_item_error(item, phase, Operation::FilePlacement, err)?;
                }
            }
        }
        Ok(PhaseRun::Completed)
    }

    fn handle_item_error(
        &self,
        item: &Item,
        phase: Phase,
        operation: Operation,
        source: InstallerError,
    ) -> Result<(), PhaseError> {
        let item_policy = item.effective_fail_policy();
        match policy::evaluate(item_policy, operation) {
            FailDecision::Continue => {
                tracing::warn!(
                    item = item.name.as_str(),
                    operation = operation.as_str(),
                    policy = item_policy.as_str(),
                    error = %source,
                    "item failed, continuing"
                );
                Ok(())
            }
            FailDecision::Stop => {
                tracing::error!(
                    item = item.name.as_str(),
                    operation = operation.as_str(),
                    policy = item_policy.as_str(),
                    error = %source,
                    "item failed, stopping phase"
                );
                Err(PhaseError::ItemFailed {
                    phase,
                    item: item.name.clone(),
                    operation,
                    source,
                })
            }
        }
    }

    fn drain_background(&self, phase: Phase) -> Result<(), PhaseError> {
        if !self.settings.track_background_processes || self.installer.background_count() == 0 {
            return Ok(());
        }

        tracing::info!(
            phase = phase.as_str(),
            count = self.installer.background_count(),
            "draining background processes"
        );
        let errors = self
            .installer
            .wait_for_background(self.settings.background_timeout());
        if errors.is_empty() {
            return Ok(());
        }
        for err in &errors {
            tracing::error!(phase = phase.as_str(), error = %err, "background process error");
        }
        Err(PhaseError::BackgroundDrain {
            phase,
            failures: errors.len(),
        })
    }
}
