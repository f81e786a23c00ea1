use mason_core::{AbsolutePath, Cancelled};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: AbsolutePath,
        source: std::io::Error,
    },

    #[error("file produced an all-zero fingerprint twice: {0}")]
    NullHash(AbsolutePath),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

pub type Result<T> = std::result::Result<T, CacheError>;
