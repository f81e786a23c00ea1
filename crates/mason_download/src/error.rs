use mason_core::{AbsolutePath, Cancelled, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {status} for {url}")]
    Status { status: u16, url: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: AbsolutePath,
        source: std::io::Error,
    },

    #[error("archive is missing at its source: {primary_key}")]
    MissingArchive { primary_key: String },

    #[error("archive requires manual download: {primary_key}")]
    ManualRequired { primary_key: String },

    #[error("no resolver configured for source: {primary_key}")]
    NoResolver { primary_key: String },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: AbsolutePath,
        expected: Hash,
        actual: Hash,
    },

    #[error("game file not found: {0}")]
    GameFileMissing(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl DownloadError {
    /// Transient failures are retried with back-off; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
            }
            DownloadError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
