use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("invalid magic read from archive header: {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported container version: {0}")]
    UnsupportedVersion(u32),

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("path is not valid inside a container: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, ContainerError>;
