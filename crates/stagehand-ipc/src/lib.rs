use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod client;
mod server;

pub use client::{call, next_request_id, wait_for_socket};
pub use server::serve;


/// Shared temp directory holding the per-user agent sockets. Both the root
/// daemon and the user agent must be able to create entries here, hence the
/// sticky world-writable mode.
pub const DEFAULT_SOCKET_DIR: &str = "/var/tmp/stagehand";

pub fn agent_socket_path(socket_dir: &Path, uid: u32) -> PathBuf {
    socket_dir.join(format!("agent-{uid}.sock"))
}

pub fn ensure_socket_dir(socket_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(socket_dir)?;
    fs::set_permissions(socket_dir, fs::Permissions::from_mode(0o1777))
}

/// One request per connection, newline-terminated JSON. The daemon issues
/// requests strictly serially, so ordering never depends on the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub donotwait: bool,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            id: String::new(),
            command,
            path: None,
            donotwait: false,
        }
    }

    pub fn with_path(command: Command, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(command)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Ping,
    Shutdown,
    RunUserScript,
    PlaceUserFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub started: bool,
    #[serde(default, rename = "exitCode", skip_serializing_if = "is_zero")]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl Response {
    pub fn ok(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ok: true,
            ..Self::default()
        }
    }

    pub fn started(id: &str) -> Self {
        Self {
            started: true,
            ..Self::ok(id)
        }
    }

    pub fn failure(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            ok: false,
            error: error.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to agent socket {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error talking to agent: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode agent response: {0}")]
    Decode(String),

    #[error("response id '{got}' does not match request id '{expected}'")]
    IdMismatch { expected: String, got: String },

    #[error("timed out waiting for agent socket at {}", path.display())]
    NotReady { path: PathBuf },
}
