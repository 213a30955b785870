use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::DownloadError;

const USER_AGENT: &str = concat!("stagehand/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP downloader. One instance is shared across the worker pool,
/// so everything here is immutable after construction apart from the
/// explicit setters used during wiring.
pub struct Client {
    agent: ureq::Agent,
    auth: Option<(String, String)>,
    headers: BTreeMap<String, String>,
    default_retries: u32,
    default_retry_wait: Duration,
    keep_failed: bool,
}

impl Client {
    pub fn new() -> Self {
        Self {
            agent: build_agent(false),
            auth: None,
            headers: BTreeMap::new(),
            default_retries: 3,
            default_retry_wait: Duration::from_secs(5),
            keep_failed: false,
        }
    }

    pub fn with_auth(
        user: Option<String>,
        password: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let auth = match (user, password) {
            (Some(user), Some(password)) if !user.is_empty() => Some((user, password)),
            _ => None,
        };
        Self {
            auth,
            headers,
            ..Self::new()
        }
    }

    /// Redirect policy is global to the client; 3xx responses surface as
    /// failures while redirects are disabled.
    pub fn set_follow_redirects(&mut self, follow: bool) {
        self.agent = build_agent(follow);
    }

    pub fn set_retry_defaults(&mut self, retries: u32, retry_wait: Duration) {
        self.default_retries = retries;
        self.default_retry_wait = retry_wait;
    }

    /// Keep hash-mismatched and half-written files on disk for
    /// troubleshooting instead of deleting them.
    pub fn set_keep_failed(&mut self, keep: bool) {
        self.keep_failed = keep;
    }

    /// Download `url` to `destination`, verifying the SHA-256 digest when
    /// one is expected. Item values of zero fall back to the client-wide
    /// retry defaults; the first attempt is immediate.
    pub fn fetch(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
        retries: u32,
        retry_wait: Duration,
    ) -> Result<(), DownloadError> {
        let retries = if retries == 0 {
            self.default_retries
        } else {
            retries
        };
        let retry_wait = if retry_wait.is_zero() {
            self.default_retry_wait
        } else {
            retry_wait
        };

        let mut last_error = None;
        for attempt in 0..=retries {
            if attempt > 0 {
                tracing::info!(
                    url,
                    attempt,
                    retries,
                    "retrying download after {}s",
                    retry_wait.as_secs()
                );
                thread::sleep(retry_wait);
            }

            match self.fetch_once(url, destination, expected_hash) {
                Ok(()) => {
                    tracing::debug!(url, attempt = attempt + 1, "download complete");
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(url, attempt = attempt + 1, error = %err, "download attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(DownloadError::Exhausted {
            attempts: retries + 1,
            source: Box::new(last_error.expect("at least one attempt ran")),
        })
    }

    fn fetch_once(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
    ) -> Result<(), DownloadError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DownloadError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }

        let mut request = self.agent.get(url);
        if let Some((user, password)) = &self.auth {
            let credentials = BASE64.encode(format!("{user}:{password}"));
            request = request.set("Authorization", &format!("Basic {credentials}"));
            tracing::debug!(user, "added basic credentials");
        }
        for (name, value) in &self.headers {
            request = request.set(name, value);
            // Value deliberately not logged; Authorization and friends stay
            // out of the log stream.
            tracing::trace!(header = name.as_str(), "added custom header");
        }
        request = request.set("User-Agent", USER_AGENT);

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => return Err(DownloadError::BadStatus(code)),
            Err(err) => return Err(DownloadError::Transport(err.to_string())),
        };
        if response.status() != 200 {
            return Err(DownloadError::BadStatus(response.status()));
        }

        let mut reader = response.into_reader();
        let mut file = File::create(destination).map_err(|err| {
            DownloadError::io(format!("failed to create {}", destination.display()), err)
        })?;
        if let Err(err) = io::copy(&mut reader, &mut file) {
            drop(file);
            if !self.keep_failed {
                let _ = fs::remove_file(destination);
            }
            return Err(DownloadError::io(
                format!("failed to write {}", destination.display()),
                err,
            ));
        }
        drop(file);

        if let Some(expected) = expected_hash {
            let actual = file_sha256_hex(destination).map_err(|err| {
                DownloadError::io(
                    format!("failed to hash {}", destination.display()),
                    err,
                )
            })?;
            if !actual.eq_ignore_ascii_case(expected) {
                if !self.keep_failed {
                    let _ = fs::remove_file(destination);
                }
                return Err(DownloadError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            tracing::debug!(path = %destination.display(), "hash verified");
        }

        Ok(())
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn build_agent(follow_redirects: bool) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .redirects(if follow_redirects { 5 } else { 0 })
        .timeout_connect(Duration::from_secs(10))
        .build()
}

pub fn file_sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
