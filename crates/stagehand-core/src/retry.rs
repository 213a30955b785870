use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A supervisor restarts the daemon on failure; the counter caps how many
/// times that loop may spin before the run is abandoned.
pub const RETRY_CAP: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryState {
    pub count: u32,
    pub first_try_unix: u64,
    pub last_try_unix: u64,
    #[serde(default)]
    pub reason: String,
}

pub trait RetryStore: Send + Sync {
    fn load(&self) -> Option<RetryState>;
    fn save(&self, state: &RetryState) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

pub struct FsRetryStore {
    path: PathBuf,
}

impl FsRetryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RetryStore for FsRetryStore {
    fn load(&self) -> Option<RetryState> {
        let raw = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn save(&self, state: &RetryState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload =
            serde_json::to_string_pretty(state).context("failed to encode retry state")?;
        fs::write(&self.path, payload)
            .with_context(|| format!("failed to write retry state: {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove retry state: {}", self.path.display())
            }),
        }
    }
}

pub struct MemoryRetryStore {
    state: Mutex<Option<RetryState>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

impl Default for MemoryRetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStore for MemoryRetryStore {
    fn load(&self) -> Option<RetryState> {
        self.state.lock().expect("retry store poisoned").clone()
    }

    fn save(&self, state: &RetryState) -> Result<()> {
        *self.state.lock().expect("retry store poisoned") = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.state.lock().expect("retry store poisoned") = None;
        Ok(())
    }
}

pub struct RetryCounter {
    store: Box<dyn RetryStore>,
}

impl RetryCounter {
    pub fn new(store: Box<dyn RetryStore>) -> Self {
        Self { store }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(Box::new(FsRetryStore::new(path)))
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryRetryStore::new()))
    }

    pub fn count(&self) -> u32 {
        self.store.load().map(|state| state.count).unwrap_or(0)
    }

    pub fn should_retry(&self) -> bool {
        self.count() < RETRY_CAP
    }

    pub fn increment(&self, reason: &str) -> Result<()> {
        let now = current_unix_timestamp()?;
        let state = match self.store.load() {
            Some(mut state) => {
                state.count += 1;
                state.last_try_unix = now;
                state.reason = reason.to_string();
                state
            }
            None => RetryState {
                count: 1,
                first_try_unix: now,
                last_try_unix: now,
                reason: reason.to_string(),
            },
        };
        self.store.save(&state)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    pub fn info(&self) -> String {
        match self.store.load() {
            Some(state) => format!(
                "attempt {}/{} (first try {}, last try {})",
                state.count, RETRY_CAP, state.first_try_unix, state.last_try_unix
            ),
            None => "first attempt".to_string(),
        }
    }
}

pub fn current_unix_timestamp() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?;
    Ok(now.as_secs())
}
