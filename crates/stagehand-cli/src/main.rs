use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use stagehand_core::{Manifest, Mode, RetryCounter, Settings};
use stagehand_installer::{MacPlatform, Platform};

mod agent;
mod bootstrap;
mod daemon;
mod standalone;
mod sysclean;


/// Managed-configuration document deployed by the provisioning service.
const DEFAULT_PROFILE_PATH: &str = "/Library/Managed Preferences/com.github.stagehand.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Daemon,
    Agent,
    Standalone,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Daemon => Mode::Daemon,
            ModeArg::Agent => Mode::Agent,
            ModeArg::Standalone => Mode::Standalone,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(about = "Bootstrap orchestrator for freshly provisioned workstations", version)]
struct Cli {
    /// Operating mode.
    #[arg(long, value_enum)]
    mode: ModeArg,

    /// URL of the remote bootstrap manifest.
    #[arg(long)]
    jsonurl: Option<String>,

    /// Installation path for downloaded artifacts and cached state.
    #[arg(long)]
    installpath: Option<PathBuf>,

    /// Managed-configuration document to read (JSON).
    #[arg(long)]
    profile_path: Option<PathBuf>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    debug: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    /// Reboot after successful completion.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    reboot: Option<bool>,

    /// Default download retry count for items that do not specify one.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Default delay between download retries, in seconds.
    #[arg(long)]
    retry_delay: Option<u64>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    cleanup_on_failure: Option<bool>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    cleanup_on_success: Option<bool>,

    /// Keep failed downloads on disk for troubleshooting.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    keep_failed_files: Option<bool>,

    /// Log what would happen without installing or executing anything.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    dry_run: Option<bool>,

    /// Track donotwait scripts and wait for them at the end of each phase.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    track_background_processes: Option<bool>,

    /// Timeout for the per-phase background drain, in seconds.
    #[arg(long)]
    background_timeout: Option<u64>,

    #[arg(long)]
    download_max_concurrency: Option<usize>,

    /// How long the daemon waits for the agent socket, in seconds.
    #[arg(long)]
    wait_for_agent_timeout: Option<u64>,

    /// Timeout per agent request, in seconds.
    #[arg(long)]
    agent_request_timeout: Option<u64>,

    #[arg(long)]
    http_auth_user: Option<String>,

    #[arg(long)]
    http_auth_password: Option<String>,

    /// Authorization header value (e.g. 'Basic xxx' or 'Bearer yyy').
    #[arg(long = "headers")]
    header_authorization: Option<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    follow_redirects: Option<bool>,

    /// Skip bootstrap manifest validation (recovery use only).
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    skip_validation: Option<bool>,

    /// LaunchAgent identifier.
    #[arg(long = "laidentifier")]
    launch_agent_identifier: Option<String>,

    /// LaunchDaemon identifier.
    #[arg(long = "ldidentifier")]
    launch_daemon_identifier: Option<String>,

    /// Tee logs to this file in addition to the console.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Clear retry state before running.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    reset_retries: Option<bool>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (settings, embedded) = match resolve_settings(&cli) {
        Ok(resolved) => resolved,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_tracing(&settings) {
        eprintln!("warning: failed to initialise logging: {err:#}");
    }

    let retry = RetryCounter::at_path(settings.retry_state_path());
    if cli.reset_retries.unwrap_or(false) {
        match retry.clear() {
            Ok(()) => tracing::info!("retry state cleared"),
            Err(err) => tracing::warn!(error = %err, "failed to clear retry state"),
        }
    }

    tracing::debug!(settings = %settings.redacted_snapshot(), "effective configuration");

    let platform: Arc<dyn Platform> = Arc::new(MacPlatform);
    let outcome = match settings.mode {
        Mode::Daemon => daemon::run_daemon(&settings, embedded, platform, &retry),
        Mode::Agent => agent::run_agent(&settings, platform),
        Mode::Standalone => standalone::run_standalone(&settings, embedded, platform),
    };

    match outcome {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "fatal error");
            ExitCode::from(1)
        }
    }
}

/// defaults → managed document (shared, then mode) → command line.
fn resolve_settings(cli: &Cli) -> Result<(Settings, Option<Manifest>)> {
    let mut settings = Settings {
        mode: cli.mode.into(),
        ..Settings::default()
    };

    let profile_path = cli
        .profile_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROFILE_PATH));
    let mut embedded = None;
    match fs::read_to_string(&profile_path) {
        Ok(raw) => {
            let doc = serde_json::from_str(&raw).with_context(|| {
                format!(
                    "managed configuration is not valid JSON: {}",
                    profile_path.display()
                )
            })?;
            let outcome = settings.apply_managed(&doc).with_context(|| {
                format!(
                    "failed to apply managed configuration: {}",
                    profile_path.display()
                )
            })?;
            embedded = outcome.embedded;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            eprintln!(
                "warning: could not read managed configuration {} ({err}); continuing with defaults",
                profile_path.display()
            );
        }
    }

    if let Some(url) = &cli.jsonurl {
        settings.json_url = Some(url.clone());
    }
    if let Some(path) = &cli.installpath {
        settings.install_path = path.clone();
    }
    if let Some(debug) = cli.debug {
        settings.debug = debug;
    }
    if let Some(verbose) = cli.verbose {
        settings.verbose = verbose;
    }
    if let Some(reboot) = cli.reboot {
        settings.reboot = reboot;
    }
    if let Some(max_retries) = cli.max_retries {
        settings.max_retries = max_retries;
    }
    if let Some(retry_delay) = cli.retry_delay {
        settings.retry_delay_secs = retry_delay;
    }
    if let Some(cleanup) = cli.cleanup_on_failure {
        settings.cleanup_on_failure = cleanup;
    }
    if let Some(cleanup) = cli.cleanup_on_success {
        settings.cleanup_on_success = cleanup;
    }
    if let Some(keep) = cli.keep_failed_files {
        settings.keep_failed_files = keep;
    }
    if let Some(dry_run) = cli.dry_run {
        settings.dry_run = dry_run;
    }
    if let Some(track) = cli.track_background_processes {
        settings.track_background_processes = track;
    }
    if let Some(timeout) = cli.background_timeout {
        settings.background_timeout_secs = timeout;
    }
    if let Some(concurrency) = cli.download_max_concurrency {
        settings.download_max_concurrency = concurrency;
    }
    if let Some(timeout) = cli.wait_for_agent_timeout {
        settings.wait_for_agent_timeout_secs = timeout;
    }
    if let Some(timeout) = cli.agent_request_timeout {
        settings.agent_request_timeout_secs = timeout;
    }
    if let Some(user) = &cli.http_auth_user {
        settings.http_auth_user = Some(user.clone());
    }
    if let Some(password) = &cli.http_auth_password {
        settings.http_auth_password = Some(password.clone());
    }
    if let Some(authorization) = &cli.header_authorization {
        if !authorization.is_empty() {
            settings
                .http_headers
                .insert("Authorization".to_string(), authorization.clone());
        }
    }
    if let Some(follow) = cli.follow_redirects {
        settings.follow_redirects = follow;
    }
    if let Some(skip) = cli.skip_validation {
        settings.skip_validation = skip;
    }
    if let Some(identifier) = &cli.launch_agent_identifier {
        settings.launch_agent_identifier = identifier.clone();
    }
    if let Some(identifier) = &cli.launch_daemon_identifier {
        settings.launch_daemon_identifier = identifier.clone();
    }
    if let Some(path) = &cli.log_file {
        settings.log_file = Some(path.clone());
    }

    let cli_chose_url = cli.jsonurl.is_some();
    settings.check_bootstrap_conflict(embedded.as_ref(), cli_chose_url)?;
    if cli_chose_url && embedded.is_some() {
        eprintln!("warning: --jsonurl overrides the managed bootstrap section");
        embedded = None;
    }

    Ok((settings, embedded))
}

fn init_tracing(settings: &Settings) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let level = if settings.verbose {
        "trace"
    } else if settings.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &settings.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}
