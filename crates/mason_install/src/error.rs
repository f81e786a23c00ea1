use mason_core::{AbsolutePath, Cancelled, Hash, RelativePath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("io error at {path}: {source}")]
    Io {
        path: AbsolutePath,
        source: std::io::Error,
    },

    #[error(transparent)]
    Modlist(#[from] mason_modlist::ModlistError),

    #[error(transparent)]
    Cache(#[from] mason_cache::CacheError),

    #[error(transparent)]
    Download(#[from] mason_download::DownloadError),

    #[error(transparent)]
    Extract(#[from] mason_extract::ExtractError),

    #[error(transparent)]
    Vfs(#[from] mason_vfs::VfsError),

    #[error(transparent)]
    Container(#[from] mason_archives::ContainerError),

    #[error("two directives target {0} with different hashes")]
    ConflictingDirectives(RelativePath),

    #[error("directive source is not in the VFS: {archive} / {path:?}")]
    UnindexedSource {
        archive: Hash,
        path: Vec<RelativePath>,
    },

    #[error("hash mismatch for {to}: expected {expected}, got {actual}")]
    HashMismatch {
        to: RelativePath,
        expected: Hash,
        actual: Hash,
    },

    #[error("malformed binary delta: {0}")]
    MalformedDelta(String),

    #[error("container readback mismatch for {container} entry {entry}")]
    ContainerReadback {
        container: RelativePath,
        entry: RelativePath,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl InstallError {
    pub fn io(path: &AbsolutePath) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
        move |source| InstallError::Io {
            path: path.clone(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;
