use mason_core::{AbsolutePath, Cancelled, RelativePath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Container(#[from] mason_archives::ContainerError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("native tool exited with code {code} ({meaning}) for {archive}{diagnostics}")]
    ToolFailed {
        code: i32,
        meaning: &'static str,
        archive: AbsolutePath,
        diagnostics: String,
    },

    #[error("extraction of {archive} produced {actual} of {expected} requested entries; missing: {missing:?}")]
    SanityCheck {
        archive: AbsolutePath,
        expected: usize,
        actual: usize,
        missing: Vec<RelativePath>,
    },

    #[error("malformed embedded installer package: {0}")]
    MalformedOmod(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ExtractError {
    /// Conventional meaning of an archive tool's exit code.
    pub fn code_meaning(code: i32) -> &'static str {
        match code {
            1 => "warning",
            2 => "fatal error",
            7 => "command line error",
            8 => "out of memory",
            255 => "corrupt archive or insufficient space",
            _ => "unknown failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtractError>;
