use std::io;

use thiserror::Error;

mod cleanup;
mod client;
mod parallel;

#[cfg(test)]
mod tests;

pub use cleanup::CleanupTracker;
pub use client::{file_sha256_hex, Client};
pub use parallel::FetchRequest;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed with status {0}")]
    BadStatus(u16),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },
}

impl DownloadError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
