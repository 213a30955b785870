use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use stagehand_installer::Platform;

use stagehand_core::Settings;

/// Best-effort teardown of everything the provisioning service installed:
/// launch service records, the agent's GUI-domain registration, and the
/// installation directory. Runs on terminal success paths only; a failing
/// daemon leaves the services in place so the supervisor can restart it.
pub fn system_cleanup(settings: &Settings, platform: &dyn Platform) {
    let daemon_plist = PathBuf::from(format!(
        "/Library/LaunchDaemons/{}.plist",
        settings.launch_daemon_identifier
    ));
    let agent_plist = PathBuf::from(format!(
        "/Library/LaunchAgents/{}.plist",
        settings.launch_agent_identifier
    ));

    remove_file_logged(&daemon_plist);
    remove_file_logged(&agent_plist);

    let uid = match platform.console_user_uid() {
        Ok(uid) => uid,
        Err(err) => {
            tracing::debug!(error = %err, "could not determine console user, defaulting to 501");
            501
        }
    };
    if let Err(err) = platform.remove_service(&format!("gui/{uid}"), &agent_plist) {
        tracing::debug!(error = %err, "agent bootout failed (may not be running)");
    }

    tracing::debug!(path = %settings.install_path.display(), "removing installation directory");
    if let Err(err) = fs::remove_dir_all(&settings.install_path) {
        tracing::debug!(error = %err, "failed to remove installation directory");
    }

    if let Err(err) = platform.remove_service("system", &daemon_plist) {
        tracing::debug!(error = %err, "daemon bootout failed (may not be running)");
    }

    if settings.reboot {
        tracing::info!("reboot requested; rebooting in 5 seconds");
        thread::sleep(Duration::from_secs(5));
        if let Err(err) = platform.schedule_reboot() {
            tracing::error!(error = %err, "failed to initiate reboot");
        }
    }
}

fn remove_file_logged(path: &PathBuf) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed launch service record"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::debug!(path = %path.display(), error = %err, "failed to remove launch service record"),
    }
}
