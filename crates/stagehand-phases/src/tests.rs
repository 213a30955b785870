use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stagehand_core::{FailPolicy, Item, ItemType, Phase, Settings, SkipIf};
use stagehand_download::Client;
use stagehand_installer::{ExecMode, Platform, SystemInstaller};

use crate::{HostArch, Operation, PhaseEngine, PhaseError, PhaseRun};

#[derive(Default)]
struct StubPlatform {
    receipt_version: Option<String>,
}

impl Platform for StubPlatform {
    fn console_user_uid(&self) -> Result<u32> {
        Ok(501)
    }

    fn run_as_console_user(&self, _script: &Path) -> Result<std::process::Output> {
        std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .output()
            .map_err(Into::into)
    }

    fn package_receipt_version(&self, _package_id: &str) -> Result<Option<String>> {
        Ok(self.receipt_version.clone())
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

struct Fixture {
    dir: tempfile::TempDir,
    client: Client,
    installer: SystemInstaller,
    settings: Settings,
}

impl Fixture {
    fn new() -> Self {
        Self::with_platform(StubPlatform::default(), false)
    }

    fn with_platform(platform: StubPlatform, dry_run: bool) -> Self {
        let mut client = Client::new();
        client.set_retry_defaults(0, Duration::ZERO);
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            client,
            installer: SystemInstaller::new(dry_run, ExecMode::Privileged, Arc::new(platform)),
            settings: Settings {
                cleanup_on_success: false,
                ..Settings::default()
            },
        }
    }

    fn engine(&self) -> PhaseEngine<'_> {
        PhaseEngine::with_host_arch(
            &self.client,
            &self.installer,
            &self.settings,
            HostArch::Intel,
        )
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut permissions = fs::metadata(&path).expect("stat").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).expect("chmod");
        path
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("dispatch.log")
    }

    fn logged(&self) -> String {
        fs::read_to_string(self.log_path()).unwrap_or_default()
    }
}

fn script_item(name: &str, file: &Path) -> Item {
    Item {
        name: name.to_string(),
        item_type: ItemType::RootScript,
        url: None,
        file: file.to_path_buf(),
        hash: None,
        packageid: None,
        version: None,
        donotwait: false,
        pkg_required: false,
        skip_if: None,
        retries: 0,
        retry_wait: 0,
        fail_policy: None,
    }
}

#[test]
fn empty_phase_completes_without_work() {
    let fixture = Fixture::new();
    let run = fixture
        .engine()
        .process(&[], Phase::SetupAssistant)
        .expect("must complete");
    assert_eq!(run, PhaseRun::Completed);
}

#[test]
fn items_run_in_manifest_order() {
    let fixture = Fixture::new();
    let log = fixture.log_path();
    let items = vec![
        script_item(
            "first",
            &fixture.script("first.sh", &format!("echo first >> {}", log.display())),
        ),
        script_item(
            "second",
            &fixture.script("second.sh", &format!("echo second >> {}", log.display())),
        ),
        script_item(
            "third",
            &fixture.script("third.sh", &format!("echo third >> {}", log.display())),
        ),
    ];

    fixture
        .engine()
        .process(&items, Phase::SetupAssistant)
        .expect("must complete");
    assert_eq!(fixture.logged(), "first\nsecond\nthird\n");
}

#[test]
fn strict_policy_stops_the_phase() {
    let fixture = Fixture::new();
    let log = fixture.log_path();
    let mut failing = script_item("boom", &fixture.script("boom.sh", "exit 1"));
    failing.fail_policy = Some(FailPolicy::FailureIsNotAnOption);
    let items = vec![
        failing,
        script_item(
            "after",
            &fixture.script("after.sh", &format!("echo after >> {}", log.display())),
        ),
    ];

    let err = fixture
        .engine()
        .process(&items, Phase::SetupAssistant)
        .expect_err("must stop");
    match err {
        PhaseError::ItemFailed {
            item, operation, ..
        } => {
            assert_eq!(item, "boom");
            assert_eq!(operation, Operation::ScriptExecution);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.logged(), "", "later items must not run");
}

#[test]
fn failable_policy_continues_past_any_failure() {
    let fixture = Fixture::new();
    let log = fixture.log_path();
    let mut failing = script_item("boom", &fixture.script("boom.sh", "exit 1"));
    failing.fail_policy = Some(FailPolicy::Failable);
    let mut missing_file = script_item("missing", Path::new("/nonexistent/file.conf"));
    missing_file.item_type = ItemType::RootFile;
    missing_file.fail_policy = Some(FailPolicy::Failable);
    let items = vec![
        failing,
        missing_file,
        script_item(
            "after",
            &fixture.script("after.sh", &format!("echo after >> {}", log.display())),
        ),
    ];

    fixture
        .engine()
        .process(&items, Phase::SetupAssistant)
        .expect("failable failures must not stop the phase");
    assert_eq!(fixture.logged(), "after\n");
}

#[test]
fn default_policy_tolerates_exec_failures_only() {
    let fixture = Fixture::new();
    let log = fixture.log_path();

    // Script failure with the default policy: phase continues.
    let items = vec![
        script_item("boom", &fixture.script("boom.sh", "exit 1")),
        script_item(
            "after",
            &fixture.script("after.sh", &format!("echo after >> {}", log.display())),
        ),
    ];
    fixture
        .engine()
        .process(&items, Phase::SetupAssistant)
        .expect("exec failure is tolerated by default");
    assert_eq!(fixture.logged(), "after\n");

    // File placement failure with the default policy: phase stops.
    let mut missing_file = script_item("missing", Path::new("/nonexistent/file.conf"));
    missing_file.item_type = ItemType::RootFile;
    let err = fixture
        .engine()
        .process(&[missing_file], Phase::SetupAssistant)
        .expect_err("placement failure must stop");
    assert!(matches!(
        err,
        PhaseError::ItemFailed {
            operation: Operation::FilePlacement,
            ..
        }
    ));
}

#[test]
fn user_items_rejected_in_root_only_phases() {
    let fixture = Fixture::new();
    let mut item = script_item("sneaky", &fixture.script("sneaky.sh", "exit 0"));
    item.item_type = ItemType::UserScript;

    let err = fixture
        .engine()
        .process(&[item.clone()], Phase::SetupAssistant)
        .expect_err("must reject");
    assert!(matches!(err, PhaseError::DisallowedItem { .. }));

    fixture
        .engine()
        .process(&[item], Phase::Userland)
        .expect("userland accepts user scripts");
}

#[test]
fn skip_if_matrix_filters_by_architecture() {
    let cases = [
        (SkipIf::Intel, HostArch::Intel, true),
        (SkipIf::X86_64, HostArch::Intel, true),
        (SkipIf::Intel, HostArch::AppleSilicon, false),
        (SkipIf::Arm64, HostArch::AppleSilicon, true),
        (SkipIf::AppleSilicon, HostArch::AppleSilicon, true),
        (SkipIf::Arm64, HostArch::Intel, false),
        (SkipIf::Unknown, HostArch::Intel, false),
        (SkipIf::Unknown, HostArch::AppleSilicon, false),
    ];
    for (skip_if, host, skipped) in cases {
        assert_eq!(
            crate::should_skip(Some(skip_if), host),
            skipped,
            "skip_if={skip_if:?} host={host:?}"
        );
    }
    assert!(!crate::should_skip(None, HostArch::Intel));
}

#[test]
fn skipped_items_never_dispatch() {
    let fixture = Fixture::new();
    let log = fixture.log_path();
    let mut skipped = script_item(
        "intel-only",
        &fixture.script("intel.sh", &format!("echo intel >> {}", log.display())),
    );
    skipped.skip_if = Some(SkipIf::Intel);
    let kept = script_item(
        "everywhere",
        &fixture.script("keep.sh", &format!("echo keep >> {}", log.display())),
    );

    fixture
        .engine()
        .process(&[skipped, kept], Phase::SetupAssistant)
        .expect("must complete");
    assert_eq!(fixture.logged(), "keep\n");
}

#[test]
fn preflight_satisfied_short_circuits_and_cleans_artifacts() {
    let mut fixture = Fixture::new();
    fixture.settings.cleanup_on_success = true;
    let gate = fixture.script("gate.sh", "exit 0");
    let item = script_item("gate", &gate);

    let run = fixture
        .engine()
        .process(&[item], Phase::Preflight)
        .expect("must run");
    assert_eq!(run, PhaseRun::PreflightSatisfied);
    assert!(!gate.exists(), "tracked artifacts are removed on the short-circuit");
}

#[test]
fn preflight_nonzero_exit_continues_bootstrap() {
    let fixture = Fixture::new();
    let item = script_item("gate", &fixture.script("gate.sh", "exit 1"));
    let run = fixture
        .engine()
        .process(&[item], Phase::Preflight)
        .expect("must run");
    assert_eq!(run, PhaseRun::Completed);
}

#[test]
fn preflight_spawn_failure_is_fatal_regardless_of_policy() {
    let fixture = Fixture::new();
    let mut item = script_item("gate", Path::new("/nonexistent/gate.sh"));
    item.fail_policy = Some(FailPolicy::Failable);

    let err = fixture
        .engine()
        .process(&[item], Phase::Preflight)
        .expect_err("must fail");
    assert!(matches!(
        err,
        PhaseError::ItemFailed {
            operation: Operation::ScriptExecution,
            ..
        }
    ));
}

#[test]
fn download_failure_aborts_before_any_dispatch() {
    // Grab a port with nothing listening behind it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let fixture = Fixture::new();
    let log = fixture.log_path();
    let mut unreachable = script_item("unreachable", &fixture.dir.path().join("payload.bin"));
    unreachable.url = Some(format!("http://127.0.0.1:{port}/payload.bin"));
    let runnable = script_item(
        "runnable",
        &fixture.script("run.sh", &format!("echo ran >> {}", log.display())),
    );

    let err = fixture
        .engine()
        .process(&[unreachable, runnable], Phase::SetupAssistant)
        .expect_err("must fail");
    match err {
        PhaseError::DownloadFailed { failed, .. } => assert_eq!(failed, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.logged(), "", "nothing installs after a failed download");
}

#[test]
fn cleanup_on_success_removes_tracked_artifacts() {
    let mut fixture = Fixture::new();
    fixture.settings.cleanup_on_success = true;
    let artifact = fixture.dir.path().join("placed.conf");
    fs::write(&artifact, b"payload").expect("write");
    let mut item = script_item("placed", &artifact);
    item.item_type = ItemType::RootFile;

    fixture
        .engine()
        .process(&[item], Phase::SetupAssistant)
        .expect("must complete");
    assert!(!artifact.exists());
}

#[test]
fn cleanup_tracker_carries_across_phases() {
    let fixture = Fixture::new();
    let first = fixture.dir.path().join("first.conf");
    let second = fixture.dir.path().join("second.conf");
    fs::write(&first, b"a").expect("write");
    fs::write(&second, b"b").expect("write");

    let mut first_item = script_item("first", &first);
    first_item.item_type = ItemType::RootFile;
    let mut second_item = script_item("second", &second);
    second_item.item_type = ItemType::RootFile;

    let engine = fixture.engine();
    engine
        .process(&[first_item], Phase::SetupAssistant)
        .expect("must complete");
    engine
        .process(&[second_item], Phase::Userland)
        .expect("must complete");
    assert!(first.exists() && second.exists());

    assert_eq!(engine.cleanup_tracked(), 2);
    assert!(!first.exists() && !second.exists());
}

#[test]
fn background_items_drain_before_phase_returns() {
    let mut fixture = Fixture::new();
    fixture.settings.track_background_processes = true;
    let marker = fixture.dir.path().join("bg-done");
    let mut item = script_item(
        "bg",
        &fixture.script("bg.sh", &format!("sleep 0.1; touch {}", marker.display())),
    );
    item.donotwait = true;

    fixture
        .engine()
        .process(&[item], Phase::SetupAssistant)
        .expect("must complete");
    assert!(marker.exists(), "drain must wait for the background script");
}

#[test]
fn background_drain_timeout_is_reported() {
    let mut fixture = Fixture::new();
    fixture.settings.track_background_processes = true;
    fixture.settings.background_timeout_secs = 0;
    let mut item = script_item("sleeper", &fixture.script("sleeper.sh", "sleep 30"));
    item.donotwait = true;

    let err = fixture
        .engine()
        .process(&[item], Phase::SetupAssistant)
        .expect_err("must time out");
    assert!(matches!(err, PhaseError::BackgroundDrain { failures: 1, .. }));
}

#[test]
fn pkg_required_skips_already_installed_package() {
    let fixture = Fixture::with_platform(
        StubPlatform {
            receipt_version: Some("2.0".to_string()),
        },
        false,
    );
    let pkg = fixture.dir.path().join("tool.pkg");
    fs::write(&pkg, b"pkg-bytes").expect("write");
    let mut item = script_item("tool", &pkg);
    item.item_type = ItemType::Package;
    item.pkg_required = true;
    item.packageid = Some("com.example.tool".to_string());
    item.version = Some("2.0".to_string());

    // `installer` is not runnable here; reaching it would fail the phase, so
    // completing proves the receipt gate skipped the install.
    fixture
        .engine()
        .process(&[item], Phase::SetupAssistant)
        .expect("must skip the install");
}

#[test]
fn dry_run_installs_packages_without_side_effects() {
    let fixture = Fixture::with_platform(StubPlatform::default(), true);
    let pkg = fixture.dir.path().join("tool.pkg");
    fs::write(&pkg, b"pkg-bytes").expect("write");
    let mut item = script_item("tool", &pkg);
    item.item_type = ItemType::Package;

    fixture
        .engine()
        .process(&[item], Phase::SetupAssistant)
        .expect("dry run must succeed");
}
