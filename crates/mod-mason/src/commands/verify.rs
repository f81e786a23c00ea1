use std::sync::Arc;

use camino::Utf8PathBuf;
use colored::Colorize;
use mason_core::CancelToken;
use mason_extract::{ExtractionSettings, HostTool};
use mason_install::{EngineSettings, Installer, InstallerConfiguration};

use super::{absolute, EXIT_OK};
use crate::errors::CliError;

pub struct VerifyArgs {
    pub modlist: Utf8PathBuf,
    pub install_dir: Utf8PathBuf,
    pub downloads_dir: Utf8PathBuf,
    pub archive_tool: Utf8PathBuf,
    pub payload_tool: Utf8PathBuf,
}

/// Re-hashes every installed file against its directive.
pub async fn verify_modlist(args: VerifyArgs) -> miette::Result<i32> {
    if !args.modlist.exists() {
        return Err(CliError::BundleNotFound { path: args.modlist }.into());
    }

    let config = InstallerConfiguration::new(
        absolute(&args.modlist)?,
        absolute(&args.install_dir)?,
        absolute(&args.downloads_dir)?,
    );
    let tools = ExtractionSettings::new(
        absolute(&args.archive_tool)?,
        absolute(&args.payload_tool)?,
    );

    let installer = Installer::new(
        config,
        tools,
        Arc::new(HostTool),
        EngineSettings::default(),
        CancelToken::never(),
    )
    .await
    .map_err(|source| CliError::Install { source })?;

    let mismatched = installer
        .verify_installed()
        .await
        .map_err(|source| CliError::Install { source })?;

    if mismatched.is_empty() {
        println!("{}", "all installed files verify".green().bold());
        return Ok(EXIT_OK);
    }
    println!(
        "{}",
        format!("{} files failed verification:", mismatched.len())
            .red()
            .bold()
    );
    for path in &mismatched {
        println!("  {path}");
    }
    Err(CliError::VerificationFailed {
        count: mismatched.len(),
    }
    .into())
}
