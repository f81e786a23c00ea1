use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("modlist bundle not found: {path}")]
    #[diagnostic(
        code(bundle::not_found),
        help("Pass the path to a .modlist bundle file")
    )]
    BundleNotFound { path: Utf8PathBuf },

    #[error("path is not absolute: {path}")]
    #[diagnostic(
        code(paths::not_absolute),
        help("The install, downloads and game directories must be absolute paths")
    )]
    NotAbsolute { path: Utf8PathBuf },

    #[error("native tool not found: {path}")]
    #[diagnostic(
        code(tools::not_found),
        help("Point --archive-tool / --payload-tool at existing binaries")
    )]
    ToolNotFound { path: Utf8PathBuf },

    #[error("install failed")]
    #[diagnostic(code(install::failed))]
    Install {
        #[source]
        source: mason_install::InstallError,
    },

    #[error("{count} installed files failed verification")]
    #[diagnostic(
        code(verify::mismatch),
        help("Re-run the install, or check the listed files for local edits")
    )]
    VerificationFailed { count: usize },

    #[error("io error")]
    #[diagnostic(code(io::operation_failed))]
    Io {
        #[from]
        source: std::io::Error,
    },
}
