use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Agent,
    Standalone,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Agent => "agent",
            Self::Standalone => "standalone",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "daemon" => Ok(Self::Daemon),
            "agent" => Ok(Self::Agent),
            "standalone" => Ok(Self::Standalone),
            other => Err(anyhow!(
                "unknown mode '{other}' (allowed: daemon, agent, standalone)"
            )),
        }
    }
}

/// Effective run configuration after defaults, the managed-configuration
/// document, and command-line flags have been layered in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mode: Mode,
    pub json_url: Option<String>,
    pub install_path: PathBuf,
    pub shared_state_dir: PathBuf,
    pub debug: bool,
    pub verbose: bool,
    pub reboot: bool,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub cleanup_on_failure: bool,
    pub cleanup_on_success: bool,
    pub keep_failed_files: bool,
    pub dry_run: bool,
    pub track_background_processes: bool,
    pub background_timeout_secs: u64,
    pub download_max_concurrency: usize,
    pub wait_for_agent_timeout_secs: u64,
    pub agent_request_timeout_secs: u64,
    pub http_auth_user: Option<String>,
    pub http_auth_password: Option<String>,
    pub http_headers: BTreeMap<String, String>,
    pub follow_redirects: bool,
    pub skip_validation: bool,
    pub launch_agent_identifier: String,
    pub launch_daemon_identifier: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Standalone,
            json_url: None,
            install_path: PathBuf::from("/Library/stagehand"),
            shared_state_dir: PathBuf::from("/var/tmp/stagehand"),
            debug: false,
            verbose: false,
            reboot: false,
            max_retries: 3,
            retry_delay_secs: 5,
            cleanup_on_failure: true,
            cleanup_on_success: true,
            keep_failed_files: false,
            dry_run: false,
            track_background_processes: false,
            background_timeout_secs: 300,
            download_max_concurrency: 4,
            wait_for_agent_timeout_secs: 86_400,
            agent_request_timeout_secs: 7_200,
            http_auth_user: None,
            http_auth_password: None,
            http_headers: BTreeMap::new(),
            follow_redirects: false,
            skip_validation: false,
            launch_agent_identifier: "com.github.stagehand.agent".to_string(),
            launch_daemon_identifier: "com.github.stagehand.daemon".to_string(),
            log_file: None,
        }
    }
}

impl Settings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }

    pub fn wait_for_agent_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_agent_timeout_secs)
    }

    pub fn agent_request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_request_timeout_secs)
    }

    /// Failed downloads are removed unless the operator asked to keep them
    /// for troubleshooting.
    pub fn cleanup_failed_downloads(&self) -> bool {
        self.cleanup_on_failure && !self.keep_failed_files
    }

    pub fn retry_state_path(&self) -> PathBuf {
        self.shared_state_dir.join(".retry-state")
    }

    /// Overlay the managed-configuration document: shared settings first,
    /// then the current mode's overrides. Returns any embedded bootstrap
    /// manifest found at the top level or under the mode section.
    pub fn apply_managed(&mut self, doc: &Value) -> Result<ManagedOutcome> {
        let Some(root) = doc.as_object() else {
            return Err(anyhow!("managed configuration is not a dictionary"));
        };

        let mut outcome = ManagedOutcome::default();

        if let Some(shared) = root.get("shared") {
            let shared = shared
                .as_object()
                .ok_or_else(|| anyhow!("managed 'shared' settings is not a dictionary"))?;
            self.apply_settings_map(shared)?;
        }

        if self.mode != Mode::Agent {
            if let Some(mode_settings) = root.get(self.mode.as_str()) {
                let mode_settings = mode_settings.as_object().ok_or_else(|| {
                    anyhow!("managed '{}' settings is not a dictionary", self.mode.as_str())
                })?;
                self.apply_settings_map(mode_settings)?;
                if let Some(bootstrap) = mode_settings.get("bootstrap") {
                    outcome.embedded = Some(parse_embedded_manifest(bootstrap)?);
                }
            }
        }

        if outcome.embedded.is_none() {
            if let Some(bootstrap) = root.get("bootstrap") {
                outcome.embedded = Some(parse_embedded_manifest(bootstrap)?);
            }
        }

        if let Some(embedded) = &outcome.embedded {
            if embedded.is_empty() {
                outcome.embedded = None;
            }
        }

        Ok(outcome)
    }

    fn apply_settings_map(&mut self, settings: &Map<String, Value>) -> Result<()> {
        if let Some(value) = settings.get("JSONURL") {
            let url = value
                .as_str()
                .ok_or_else(|| anyhow!("JSONURL must be a string"))?;
            if url.is_empty() {
                return Err(anyhow!("JSONURL cannot be an empty string; omit the key instead"));
            }
            self.json_url = Some(url.to_string());
        }
        if let Some(path) = string_setting(settings, "InstallPath")? {
            if !path.is_empty() {
                self.install_path = PathBuf::from(path);
            }
        }
        if let Some(value) = bool_setting(settings, "Debug")? {
            self.debug = value;
        }
        if let Some(value) = bool_setting(settings, "Verbose")? {
            self.verbose = value;
        }
        if let Some(value) = bool_setting(settings, "Reboot")? {
            self.reboot = value;
        }
        if let Some(value) = int_setting(settings, "MaxRetries")? {
            self.max_retries = value as u32;
        }
        if let Some(value) = int_setting(settings, "RetryDelay")? {
            self.retry_delay_secs = value;
        }
        if let Some(value) = bool_setting(settings, "CleanupOnFailure")? {
            self.cleanup_on_failure = value;
        }
        if let Some(value) = bool_setting(settings, "CleanupOnSuccess")? {
            self.cleanup_on_success = value;
        }
        if let Some(value) = bool_setting(settings, "KeepFailedFiles")? {
            self.keep_failed_files = value;
        }
        if let Some(value) = bool_setting(settings, "DryRun")? {
            self.dry_run = value;
        }
        if let Some(value) = bool_setting(settings, "TrackBackgroundProcesses")? {
            self.track_background_processes = value;
        }
        if let Some(value) = int_setting(settings, "BackgroundTimeout")? {
            self.background_timeout_secs = value;
        }
        if let Some(value) = int_setting(settings, "DownloadMaxConcurrency")? {
            self.download_max_concurrency = value as usize;
        }
        if let Some(value) = int_setting(settings, "WaitForAgentTimeout")? {
            self.wait_for_agent_timeout_secs = value;
        }
        if let Some(value) = int_setting(settings, "AgentRequestTimeout")? {
            self.agent_request_timeout_secs = value;
        }
        if let Some(user) = string_setting(settings, "HTTPAuthUser")? {
            self.http_auth_user = Some(user);
        }
        if let Some(password) = string_setting(settings, "HTTPAuthPassword")? {
            self.http_auth_password = Some(password);
        }
        if let Some(value) = settings.get("HTTPHeaders") {
            for (name, header) in parse_http_headers(value)? {
                self.http_headers.insert(name, header);
            }
        }
        if let Some(value) = string_setting(settings, "HeaderAuthorization")? {
            if !value.is_empty() {
                self.http_headers
                    .insert("Authorization".to_string(), value);
            }
        }
        if let Some(value) = bool_setting(settings, "FollowRedirects")? {
            self.follow_redirects = value;
        }
        if let Some(value) = bool_setting(settings, "SkipValidation")? {
            self.skip_validation = value;
        }
        if let Some(value) = string_setting(settings, "LaunchAgentIdentifier")? {
            self.launch_agent_identifier = value;
        }
        if let Some(value) = string_setting(settings, "LaunchDaemonIdentifier")? {
            self.launch_daemon_identifier = value;
        }
        Ok(())
    }

    /// Both a remote URL and an embedded bootstrap is ambiguous unless the
    /// command line explicitly picked the URL.
    pub fn check_bootstrap_conflict(
        &self,
        embedded: Option<&Manifest>,
        cli_chose_url: bool,
    ) -> Result<()> {
        if self.json_url.is_some() && embedded.is_some() && !cli_chose_url {
            return Err(anyhow!(
                "managed configuration declares both JSONURL and an embedded bootstrap section; choose one bootstrap source"
            ));
        }
        Ok(())
    }

    /// Snapshot for startup debug logging with credential values masked.
    pub fn redacted_snapshot(&self) -> Value {
        let masked_headers: BTreeMap<&str, &str> = self
            .http_headers
            .keys()
            .map(|name| (name.as_str(), "***redacted***"))
            .collect();
        json!({
            "mode": self.mode.as_str(),
            "json_url": self.json_url,
            "install_path": self.install_path.display().to_string(),
            "shared_state_dir": self.shared_state_dir.display().to_string(),
            "debug": self.debug,
            "verbose": self.verbose,
            "reboot": self.reboot,
            "max_retries": self.max_retries,
            "retry_delay_secs": self.retry_delay_secs,
            "cleanup_on_failure": self.cleanup_on_failure,
            "cleanup_on_success": self.cleanup_on_success,
            "keep_failed_files": self.keep_failed_files,
            "dry_run": self.dry_run,
            "track_background_processes": self.track_background_processes,
            "background_timeout_secs": self.background_timeout_secs,
            "download_max_concurrency": self.download_max_concurrency,
            "wait_for_agent_timeout_secs": self.wait_for_agent_timeout_secs,
            "agent_request_timeout_secs": self.agent_request_timeout_secs,
            "http_auth_user": self.http_auth_user,
            "http_auth_password": self.http_auth_password.as_deref().map(|_| "***redacted***"),
            "http_headers": masked_headers,
            "follow_redirects": self.follow_redirects,
            "skip_validation": self.skip_validation,
            "launch_agent_identifier": self.launch_agent_identifier,
            "launch_daemon_identifier": self.launch_daemon_identifier,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagedOutcome {
    pub embedded: Option<Manifest>,
}

fn parse_embedded_manifest(value: &Value) -> Result<Manifest> {
    serde_json::from_value(value.clone())
        .map_err(|err| anyhow!("managed 'bootstrap' section is not a valid manifest: {err}"))
}

fn string_setting(settings: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match settings.get(key) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(anyhow!("managed setting '{key}' must be a string")),
    }
}

fn bool_setting(settings: &Map<String, Value>, key: &str) -> Result<Option<bool>> {
    match settings.get(key) {
        None => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(Value::String(value)) => match value.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(anyhow!("managed setting '{key}' must be a boolean")),
        },
        Some(_) => Err(anyhow!("managed setting '{key}' must be a boolean")),
    }
}

fn int_setting(settings: &Map<String, Value>, key: &str) -> Result<Option<u64>> {
    match settings.get(key) {
        None => Ok(None),
        Some(Value::Number(value)) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("managed setting '{key}' must be a non-negative integer")),
        Some(Value::String(value)) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("managed setting '{key}' must be a non-negative integer")),
        Some(_) => Err(anyhow!("managed setting '{key}' must be a non-negative integer")),
    }
}

/// HTTPHeaders accepts either a name→value dictionary or a list of
/// `{name, value}` records.
fn parse_http_headers(value: &Value) -> Result<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    match value {
        Value::Object(map) => {
            for (name, header) in map {
                let header = header
                    .as_str()
                    .ok_or_else(|| anyhow!("HTTPHeaders value for '{name}' must be a string"))?;
                headers.insert(name.clone(), header.to_string());
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                let record = entry
                    .as_object()
                    .ok_or_else(|| anyhow!("HTTPHeaders entries must be {{name, value}} records"))?;
                let name = record
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("HTTPHeaders entry is missing a 'name' string"))?;
                let header = record
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("HTTPHeaders entry is missing a 'value' string"))?;
                headers.insert(name.to_string(), header.to_string());
            }
        }
        _ => {
            return Err(anyhow!(
                "HTTPHeaders must be a dictionary or a list of {{name, value}} records"
            ))
        }
    }
    Ok(headers)
}
