use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::{
    ExecMode, FileKind, InstallerError, Platform, PreflightVerdict, ProcessTracker, ScriptStatus,
    SystemInstaller,
};

#[derive(Default)]
struct StubPlatform {
    receipt_version: Option<Option<String>>,
    receipt_error: bool,
    ran_as_user: Mutex<Vec<PathBuf>>,
}

impl Platform for StubPlatform {
    fn console_user_uid(&self) -> Result<u32> {
        Ok(501)
    }

    fn run_as_console_user(&self, script: &Path) -> Result<Output> {
        self.ran_as_user
            .lock()
            .expect("stub poisoned")
            .push(script.to_path_buf());
        std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .output()
            .map_err(Into::into)
    }

    fn package_receipt_version(&self, _package_id: &str) -> Result<Option<String>> {
        if self.receipt_error {
            return Err(anyhow!("receipt database unavailable"));
        }
        Ok(self.receipt_version.clone().unwrap_or(None))
    }

    fn chown_to_uid(&self, _path: &Path, _uid: u32) -> Result<()> {
        Ok(())
    }

    fn remove_service(&self, _domain: &str, _plist: &Path) -> Result<()> {
        Ok(())
    }

    fn schedule_reboot(&self) -> Result<()> {
        Ok(())
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut permissions = fs::metadata(&path).expect("stat script").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("chmod script");
    path
}

fn installer(mode: ExecMode) -> SystemInstaller {
    SystemInstaller::new(false, mode, Arc::new(StubPlatform::default()))
}

#[test]
fn foreground_script_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "ok.sh", "echo done; exit 0");

    let status = installer(ExecMode::Privileged)
        .run_script(&script, false, false, false)
        .expect("script must succeed");
    assert_eq!(status, ScriptStatus::Completed);
}

#[test]
fn foreground_script_failure_carries_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "fail.sh",
        "echo something broke; echo details >&2; exit 3",
    );

    let err = installer(ExecMode::Privileged)
        .run_script(&script, false, false, false)
        .expect_err("script must fail");
    match err {
        InstallerError::ExecFailed { output, .. } => {
            assert!(output.contains("something broke"));
            assert!(output.contains("details"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_script_is_reported() {
    let err = installer(ExecMode::Privileged)
        .run_script(Path::new("/nonexistent/script.sh"), false, false, false)
        .expect_err("must fail");
    assert!(matches!(err, InstallerError::ScriptMissing(_)));
}

#[test]
fn script_made_executable_before_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("plain.sh");
    fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write script");
    let mut permissions = fs::metadata(&path).expect("stat").permissions();
    permissions.set_mode(0o600);
    fs::set_permissions(&path, permissions).expect("chmod");

    installer(ExecMode::Privileged)
        .run_script(&path, false, false, false)
        .expect("runner makes the script executable");
    let mode = fs::metadata(&path).expect("stat").permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn user_script_in_privileged_mode_routes_through_platform() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "user.sh", "exit 0");

    let platform = Arc::new(StubPlatform::default());
    let shared: Arc<dyn Platform> = platform.clone();
    let system = SystemInstaller::new(false, ExecMode::Privileged, shared);
    system
        .run_script(&script, true, false, false)
        .expect("must succeed");
    assert_eq!(
        platform.ran_as_user.lock().expect("stub").as_slice(),
        &[script]
    );
}

#[test]
fn user_script_in_user_mode_runs_directly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("ran");
    let script = write_script(
        dir.path(),
        "user.sh",
        &format!("touch {}", marker.display()),
    );

    let platform = Arc::new(StubPlatform::default());
    let shared: Arc<dyn Platform> = platform.clone();
    let system = SystemInstaller::new(false, ExecMode::User, shared);
    system
        .run_script(&script, true, false, false)
        .expect("must succeed");
    assert!(marker.exists());
    assert!(platform.ran_as_user.lock().expect("stub").is_empty());
}

#[test]
fn preflight_exit_zero_is_satisfied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "gate.sh", "exit 0");
    let verdict = installer(ExecMode::Privileged)
        .run_preflight_script(&script)
        .expect("must run");
    assert_eq!(verdict, PreflightVerdict::Satisfied);
}

#[test]
fn preflight_nonzero_exit_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "gate.sh", "exit 1");
    let verdict = installer(ExecMode::Privileged)
        .run_preflight_script(&script)
        .expect("must run");
    assert_eq!(verdict, PreflightVerdict::Continue);
}

#[test]
fn preflight_missing_script_is_an_error() {
    let err = installer(ExecMode::Privileged)
        .run_preflight_script(Path::new("/nonexistent/gate.sh"))
        .expect_err("must fail");
    assert!(matches!(err, InstallerError::ScriptMissing(_)));
}

#[test]
fn tracked_background_scripts_are_drained() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("bg-done");
    let script = write_script(
        dir.path(),
        "bg.sh",
        &format!("sleep 0.1; touch {}", marker.display()),
    );

    let system = installer(ExecMode::Privileged);
    let status = system
        .run_script(&script, false, true, true)
        .expect("must start");
    assert_eq!(status, ScriptStatus::StartedTracked);
    assert_eq!(system.background_count(), 1);

    let errors = system.wait_for_background(Duration::from_secs(10));
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert!(marker.exists());
    assert_eq!(system.background_count(), 0);
}

#[test]
fn background_failure_is_reported_by_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "bg-fail.sh", "exit 7");

    let system = installer(ExecMode::Privileged);
    system
        .run_script(&script, false, true, true)
        .expect("must start");

    let errors = system.wait_for_background(Duration::from_secs(10));
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        InstallerError::BackgroundFailed { name, .. } => {
            assert!(name.contains("bg-fail.sh"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn background_drain_timeout_kills_survivors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "sleeper.sh", "sleep 30");

    let system = installer(ExecMode::Privileged);
    system
        .run_script(&script, false, true, true)
        .expect("must start");

    let start = Instant::now();
    let errors = system.wait_for_background(Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(5), "drain must not wait for the sleeper");
    assert!(errors
        .iter()
        .any(|err| matches!(err, InstallerError::BackgroundTimeout { survivors: 1 })));
    assert_eq!(system.background_count(), 0);
}

#[test]
fn detached_scripts_are_not_tracked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "detached.sh", "exit 0");

    let system = installer(ExecMode::Privileged);
    let status = system
        .run_script(&script, false, true, false)
        .expect("must start");
    assert_eq!(status, ScriptStatus::StartedDetached);
    assert_eq!(system.background_count(), 0);
}

#[test]
fn wait_with_no_background_processes_is_empty() {
    let tracker = ProcessTracker::new();
    assert!(tracker.wait_all(Duration::from_millis(10)).is_empty());
}

#[test]
fn dry_run_skips_execution() {
    let platform = Arc::new(StubPlatform::default());
    let system = SystemInstaller::new(true, ExecMode::Privileged, platform);
    let status = system
        .run_script(Path::new("/nonexistent/script.sh"), false, false, false)
        .expect("dry run always succeeds");
    assert_eq!(status, ScriptStatus::Completed);

    system
        .place_file(Path::new("/nonexistent/file.conf"), FileKind::Root)
        .expect("dry run always succeeds");
    system
        .install_package(Path::new("/nonexistent/pkg.pkg"), "/")
        .expect("dry run always succeeds");
}

#[test]
fn place_file_sets_mode_by_kind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root_file = dir.path().join("root.conf");
    let user_file = dir.path().join("user.command");
    fs::write(&root_file, b"x").expect("write");
    fs::write(&user_file, b"y").expect("write");

    let system = installer(ExecMode::Privileged);
    system
        .place_file(&root_file, FileKind::Root)
        .expect("must place");
    system
        .place_file(&user_file, FileKind::User)
        .expect("must place");

    assert_eq!(
        fs::metadata(&root_file).expect("stat").permissions().mode() & 0o777,
        0o644
    );
    assert_eq!(
        fs::metadata(&user_file).expect("stat").permissions().mode() & 0o777,
        0o755
    );
}

#[test]
fn place_missing_file_is_reported() {
    let err = installer(ExecMode::Privileged)
        .place_file(Path::new("/nonexistent/file.conf"), FileKind::Root)
        .expect_err("must fail");
    assert!(matches!(err, InstallerError::FileMissing(_)));
}

#[test]
fn receipt_gate_without_package_id_counts_as_installed() {
    let system = installer(ExecMode::Privileged);
    assert!(system.receipt_satisfied(None, None).expect("must check"));
    assert!(system.receipt_satisfied(Some(""), None).expect("must check"));
}

#[test]
fn receipt_gate_checks_installed_version() {
    let cases = [
        // (installed receipt, required version, satisfied)
        (None, Some("2.0"), false),
        (Some("2.0".to_string()), Some("2.0"), true),
        (Some("1.9".to_string()), Some("2.0"), false),
        (Some("1.9".to_string()), None, true),
        (Some(String::new()), Some("2.0"), true),
    ];

    for (installed, required, satisfied) in cases {
        let platform = Arc::new(StubPlatform {
            receipt_version: Some(installed.clone()),
            ..StubPlatform::default()
        });
        let system = SystemInstaller::new(false, ExecMode::Privileged, platform);
        let got = system
            .receipt_satisfied(Some("com.example.pkg"), required)
            .expect("must check");
        assert_eq!(got, satisfied, "installed={installed:?} required={required:?}");
    }
}

#[test]
fn receipt_query_failure_is_typed() {
    let platform = Arc::new(StubPlatform {
        receipt_error: true,
        ..StubPlatform::default()
    });
    let system = SystemInstaller::new(false, ExecMode::Privileged, platform);
    let err = system
        .receipt_satisfied(Some("com.example.pkg"), None)
        .expect_err("must fail");
    assert!(matches!(err, InstallerError::ReceiptQuery(_)));
}
