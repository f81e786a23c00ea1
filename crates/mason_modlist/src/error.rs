use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModlistError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("bundle error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("modlist parse failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bundle has no top-level 'modlist' entry")]
    MissingModlistEntry,

    #[error("inline blob not found in bundle: {0}")]
    BlobNotFound(String),
}

pub type Result<T> = std::result::Result<T, ModlistError>;
