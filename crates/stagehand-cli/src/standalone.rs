use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use stagehand_core::{Manifest, Phase, Settings};
use stagehand_installer::{ExecMode, Platform, SystemInstaller};
use stagehand_phases::{PhaseEngine, PhaseRun};

use crate::bootstrap::load_manifest;
use crate::daemon::build_client;
use crate::sysclean::system_cleanup;

/// Single-process recovery: clean up whatever a previous run left behind,
/// then drive all three phases in this (privileged) process. User scripts go
/// through the console-user wrapper instead of the agent protocol.
pub fn run_standalone(
    settings: &Settings,
    embedded: Option<Manifest>,
    platform: Arc<dyn Platform>,
) -> Result<i32> {
    tracing::info!("starting standalone recovery run");
    pre_clean(settings, platform.as_ref());

    let client = build_client(settings);
    let manifest = match load_manifest(settings, embedded, &client) {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::error!(error = %err, "failed to load bootstrap manifest");
            return Ok(1);
        }
    };

    let installer = SystemInstaller::new(settings.dry_run, ExecMode::Privileged, platform.clone());
    let engine = PhaseEngine::new(&client, &installer, settings);

    for phase in [Phase::Preflight, Phase::SetupAssistant, Phase::Userland] {
        match engine.process(manifest.items_for(phase), phase) {
            Ok(PhaseRun::Completed) => {}
            Ok(PhaseRun::PreflightSatisfied) => {
                tracing::info!("provisioning already satisfied; cleaning up and exiting");
                system_cleanup(settings, platform.as_ref());
                return Ok(0);
            }
            Err(err) => {
                tracing::error!(phase = phase.as_str(), error = %err, "phase failed");
                return Ok(1);
            }
        }
    }

    tracing::info!("all phases completed");
    system_cleanup(settings, platform.as_ref());
    Ok(0)
}

/// Tear down stale services and reset the installation directory, keeping
/// only this binary if it happens to live there.
fn pre_clean(settings: &Settings, platform: &dyn Platform) {
    let daemon_plist = PathBuf::from(format!(
        "/Library/LaunchDaemons/{}.plist",
        settings.launch_daemon_identifier
    ));
    let agent_plist = PathBuf::from(format!(
        "/Library/LaunchAgents/{}.plist",
        settings.launch_agent_identifier
    ));
    let uid = platform.console_user_uid().unwrap_or(501);
    if let Err(err) = platform.remove_service("system", &daemon_plist) {
        tracing::debug!(error = %err, "daemon service stop failed (may not be running)");
    }
    if let Err(err) = platform.remove_service(&format!("gui/{uid}"), &agent_plist) {
        tracing::debug!(error = %err, "agent service stop failed (may not be running)");
    }

    let own_binary = std::env::current_exe().ok();
    match fs::read_dir(&settings.install_path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if own_binary.as_deref() == Some(path.as_path()) {
                    tracing::debug!(path = %path.display(), "preserving running binary");
                    continue;
                }
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match removed {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale state"),
                    Err(err) => {
                        tracing::debug!(path = %path.display(), error = %err, "failed to remove stale state");
                    }
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(error = %err, "failed to inspect installation directory"),
    }
    if let Err(err) = fs::create_dir_all(&settings.install_path) {
        tracing::debug!(error = %err, "failed to recreate installation directory");
    }
}
