mod hash;
mod install;
mod verify;

pub use hash::{hash_file, HashFileArgs};
pub use install::{install_modlist, InstallArgs};
pub use verify::{verify_modlist, VerifyArgs};

use camino::Utf8PathBuf;
use mason_core::AbsolutePath;

use crate::errors::CliError;

pub(crate) fn absolute(path: &Utf8PathBuf) -> Result<AbsolutePath, CliError> {
    AbsolutePath::new(path.clone()).map_err(|_| CliError::NotAbsolute { path: path.clone() })
}

/// Process exit codes shared by the verbs.
pub const EXIT_OK: i32 = 0;
pub const EXIT_MANUAL_DOWNLOADS: i32 = 1;
pub const EXIT_FAILURE: i32 = 2;
