use std::sync::Arc;

use anyhow::{anyhow, Result};
use stagehand_core::{Item, ItemType, Manifest, Phase, RetryCounter, Settings};
use stagehand_download::{Client, FetchRequest};
use stagehand_installer::{ExecMode, FileKind, Platform, SystemInstaller};
use stagehand_ipc::{agent_socket_path, Command, Request};
use stagehand_phases::{evaluate, FailDecision, Operation, PhaseEngine, PhaseRun};

use crate::bootstrap::load_manifest;
use crate::sysclean::system_cleanup;

/// Root-privileged driver: runs preflight and setupassistant locally, then
/// orchestrates userland item-by-item, delegating user-context work to the
/// agent over the socket protocol.
pub fn run_daemon(
    settings: &Settings,
    embedded: Option<Manifest>,
    platform: Arc<dyn Platform>,
    retry: &RetryCounter,
) -> Result<i32> {
    if !retry.should_retry() {
        tracing::error!(
            "maximum retry attempts exceeded ({}); giving up without restarting",
            retry.info()
        );
        // Exit success so the supervisor does not spin the restart loop.
        return Ok(0);
    }
    tracing::info!(attempt = retry.info().as_str(), "starting daemon");
    if let Err(err) = retry.increment("daemon started") {
        tracing::error!(error = %err, "failed to update retry state");
    }

    let client = build_client(settings);
    let manifest = match load_manifest(settings, embedded, &client) {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::error!(error = %err, "failed to load bootstrap manifest");
            return Ok(1);
        }
    };
    tracing::info!(
        preflight = manifest.preflight.len(),
        setupassistant = manifest.setupassistant.len(),
        userland = manifest.userland.len(),
        "bootstrap manifest loaded"
    );

    let installer = SystemInstaller::new(settings.dry_run, ExecMode::Privileged, Arc::clone(&platform));
    let engine = PhaseEngine::new(&client, &installer, settings);

    match engine.process(&manifest.preflight, Phase::Preflight) {
        Ok(PhaseRun::Completed) => {}
        Ok(PhaseRun::PreflightSatisfied) => {
            tracing::info!("provisioning already satisfied; cleaning up and exiting");
            if let Err(err) = retry.clear() {
                tracing::error!(error = %err, "failed to clear retry state");
            }
            system_cleanup(settings, platform.as_ref());
            return Ok(0);
        }
        Err(err) => {
            tracing::error!(error = %err, "preflight phase failed");
            return Ok(1);
        }
    }

    if let Err(err) = engine.process(&manifest.setupassistant, Phase::SetupAssistant) {
        tracing::error!(error = %err, "setupassistant phase failed");
        return Ok(1);
    }

    if !manifest.userland.is_empty() {
        if let Err(err) = run_userland(settings, &manifest.userland, &client, &installer, &platform)
        {
            tracing::error!(error = %err, "userland phase failed");
            return Ok(1);
        }
    } else {
        tracing::debug!("no userland items present");
    }

    tracing::info!("all phases completed");
    if let Err(err) = retry.clear() {
        tracing::error!(error = %err, "failed to clear retry state");
    }
    system_cleanup(settings, platform.as_ref());
    Ok(0)
}

pub fn build_client(settings: &Settings) -> Client {
    let mut client = if settings.http_auth_user.is_some() || !settings.http_headers.is_empty() {
        Client::with_auth(
            settings.http_auth_user.clone(),
            settings.http_auth_password.clone(),
            settings.http_headers.clone(),
        )
    } else {
        Client::new()
    };
    client.set_follow_redirects(settings.follow_redirects);
    client.set_retry_defaults(settings.max_retries, settings.retry_delay());
    client.set_keep_failed(settings.keep_failed_files);
    client
}

/// The daemon is the single orchestrator for userland: it pre-downloads
/// everything, waits for the agent, then walks the items in manifest order.
fn run_userland(
    settings: &Settings,
    items: &[Item],
    client: &Client,
    installer: &SystemInstaller,
    platform: &Arc<dyn Platform>,
) -> Result<()> {
    let host_arch = stagehand_phases::detect();
    let runnable: Vec<&Item> = items
        .iter()
        .filter(|item| {
            if stagehand_phases::should_skip(item.skip_if, host_arch) {
                tracing::info!(item = item.name.as_str(), "skipping item for this architecture");
                false
            } else {
                true
            }
        })
        .collect();
    if runnable.is_empty() {
        return Ok(());
    }

    pre_download(settings, &runnable, client)?;

    let uid = platform.console_user_uid()?;
    let socket = agent_socket_path(&settings.shared_state_dir, uid);
    tracing::info!(socket = %socket.display(), "waiting for agent readiness");
    stagehand_ipc::wait_for_socket(&socket, settings.wait_for_agent_timeout())
        .map_err(|err| anyhow!("agent readiness wait failed: {err}"))?;

    let mut background_started = false;
    for (index, item) in runnable.iter().enumerate() {
        tracing::info!(
            item = item.name.as_str(),
            kind = item.item_type.as_str(),
            position = format!("{}/{}", index + 1, runnable.len()),
            "userland item"
        );
        match item.item_type {
            ItemType::UserScript => {
                platform.chown_to_uid(&item.file, uid)?;
                let mut request = Request::with_path(Command::RunUserScript, &item.file);
                request.donotwait = item.donotwait;
                let response =
                    stagehand_ipc::call(&socket, request, settings.agent_request_timeout())
                        .map_err(|err| anyhow!("agent request failed for '{}': {err}", item.name))?;
                if !response.ok {
                    apply_fail_policy(item, Operation::ScriptExecution, &response.error)?;
                } else if response.started {
                    tracing::info!(item = item.name.as_str(), "user script delegated (background)");
                } else {
                    tracing::info!(item = item.name.as_str(), "user script completed");
                }
            }
            ItemType::UserFile => {
                platform.chown_to_uid(&item.file, uid)?;
                let request = Request::with_path(Command::PlaceUserFile, &item.file);
                let response =
                    stagehand_ipc::call(&socket, request, settings.agent_request_timeout())
                        .map_err(|err| anyhow!("agent request failed for '{}': {err}", item.name))?;
                if !response.ok {
                    apply_fail_policy(item, Operation::FilePlacement, &response.error)?;
                } else {
                    tracing::info!(item = item.name.as_str(), "user file placed");
                }
            }
            ItemType::Package => {
                if item.pkg_required {
                    match installer
                        .receipt_satisfied(item.packageid.as_deref(), item.version.as_deref())
                    {
                        Ok(true) => {
                            tracing::info!(item = item.name.as_str(), "package already installed, skipping");
                            continue;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            apply_fail_policy(item, Operation::ReceiptCheck, &err.to_string())?;
                            continue;
                        }
                    }
                }
                if let Err(err) = installer.install_package(&item.file, "/") {
                    apply_fail_policy(item, Operation::PackageInstall, &err.to_string())?;
                }
            }
            ItemType::RootScript => {
                match installer.run_script(
                    &item.file,
                    false,
                    item.donotwait,
                    settings.track_background_processes,
                ) {
                    Ok(_) => {
                        if item.donotwait && settings.track_background_processes {
                            background_started = true;
                        }
                    }
                    Err(err) => {
                        apply_fail_policy(item, Operation::ScriptExecution, &err.to_string())?;
                    }
                }
            }
            ItemType::RootFile => {
                if let Err(err) = installer.place_file(&item.file, FileKind::Root) {
                    apply_fail_policy(item, Operation::FilePlacement, &err.to_string())?;
                }
            }
        }
    }

    if background_started && installer.background_count() > 0 {
        let errors = installer.wait_for_background(settings.background_timeout());
        if !errors.is_empty() {
            for err in &errors {
                tracing::error!(error = %err, "background process error in userland");
            }
            return Err(anyhow!(
                "background processes failed in userland: {} errors",
                errors.len()
            ));
        }
    }

    tracing::info!("userland processing completed");
    let shutdown = Request::new(Command::Shutdown);
    if let Err(err) = stagehand_ipc::call(&socket, shutdown, settings.agent_request_timeout()) {
        tracing::debug!(error = %err, "agent shutdown request failed (non-fatal)");
    }
    Ok(())
}

fn pre_download(settings: &Settings, items: &[&Item], client: &Client) -> Result<()> {
    tracing::info!(total = items.len(), "pre-downloading userland items");
    let requests: Vec<FetchRequest> = items
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

    let results = client.fetch_many(
        &requests,
        settings.download_max_concurrency,
        settings.cleanup_failed_downloads(),
    );

    let mut failed = 0;
    for (item, result) in items.iter().zip(results) {
        if let Err(err) = result {
            tracing::error!(item = item.name.as_str(), error = %err, "failed to download userland item");
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(anyhow!("failed to download {failed} userland items"));
    }
    Ok(())
}

fn apply_fail_policy(item: &Item, operation: Operation, detail: &str) -> Result<()> {
    let policy = item.effective_fail_policy();
    match evaluate(policy, operation) {
        FailDecision::Continue => {
            tracing::warn!(
                item = item.name.as_str(),
                operation = operation.as_str(),
                policy = policy.as_str(),
                detail,
                "userland item failed, continuing"
            );
            Ok(())
        }
        FailDecision::Stop => Err(anyhow!(
            "{} failed for '{}': {detail}",
            operation.as_str(),
            item.name
        )),
    }
}
