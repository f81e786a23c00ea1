use std::sync::Arc;

use camino::Utf8PathBuf;
use colored::Colorize;
use mason_core::CancelToken;
use mason_extract::{CompatTool, ExtractionSettings, HostTool, NativeTool};
use mason_install::{
    EngineSettings, InstallOutcome, Installer, InstallerConfiguration, SystemParameters,
};
use miette::IntoDiagnostic;
use tracing::info;

use super::{absolute, EXIT_FAILURE, EXIT_MANUAL_DOWNLOADS, EXIT_OK};
use crate::errors::CliError;

pub struct InstallArgs {
    pub modlist: Utf8PathBuf,
    pub install_dir: Utf8PathBuf,
    pub downloads_dir: Utf8PathBuf,
    pub game_dir: Option<Utf8PathBuf>,
    pub archive_tool: Utf8PathBuf,
    pub fallback_archive_tool: Option<Utf8PathBuf>,
    pub payload_tool: Utf8PathBuf,
    pub compat_runner: Option<Utf8PathBuf>,
    pub screen_width: u32,
    pub screen_height: u32,
    pub settings: Option<Utf8PathBuf>,
}

pub async fn install_modlist(args: InstallArgs) -> miette::Result<i32> {
    if !args.modlist.exists() {
        return Err(CliError::BundleNotFound { path: args.modlist }.into());
    }
    for tool in [&args.archive_tool, &args.payload_tool] {
        if !tool.exists() {
            return Err(CliError::ToolNotFound { path: tool.clone() }.into());
        }
    }

    let mut config = InstallerConfiguration::new(
        absolute(&args.modlist)?,
        absolute(&args.install_dir)?,
        absolute(&args.downloads_dir)?,
    )
    .with_system(SystemParameters {
        screen_width: args.screen_width,
        screen_height: args.screen_height,
        ..SystemParameters::default()
    });
    if let Some(game_dir) = &args.game_dir {
        config = config.with_game_dir(absolute(game_dir)?);
    }

    let mut tools = ExtractionSettings::new(
        absolute(&args.archive_tool)?,
        absolute(&args.payload_tool)?,
    );
    if let Some(fallback) = &args.fallback_archive_tool {
        tools = tools.with_fallback_tool(absolute(fallback)?);
    }

    let invoker: Arc<dyn NativeTool> = match &args.compat_runner {
        Some(runner) => Arc::new(CompatTool::new(absolute(runner)?, 'Z')),
        None => Arc::new(HostTool),
    };

    let engine_settings = match &args.settings {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(CliError::from)?;
            serde_json::from_str(&contents).into_diagnostic()?
        }
        None => EngineSettings::default(),
    };

    let (cancel, token) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "interrupt received, stopping at the next phase".yellow());
            cancel.cancel();
        }
    });

    let mut installer = Installer::new(config, tools, invoker, engine_settings, token)
        .await
        .map_err(|source| CliError::Install { source })?;

    let outcome = installer
        .run()
        .await
        .map_err(|source| CliError::Install { source })?;
    log_resource_totals(&installer);

    Ok(match outcome {
        InstallOutcome::Completed => {
            println!("{}", "install complete".green().bold());
            EXIT_OK
        }
        InstallOutcome::Cancelled => {
            println!("{}", "install cancelled".yellow().bold());
            EXIT_FAILURE
        }
        InstallOutcome::DownloadFailed { manual, missing } => {
            if !manual.is_empty() {
                println!(
                    "{}",
                    format!("{} archives must be downloaded manually:", manual.len())
                        .red()
                        .bold()
                );
                for item in &manual {
                    println!("  {} {}", item.name.bold(), item.url.underline());
                    if let Some(prompt) = &item.prompt {
                        println!("    {prompt}");
                    }
                }
                EXIT_MANUAL_DOWNLOADS
            } else {
                println!("{}", "archives could not be downloaded:".red().bold());
                for key in &missing {
                    println!("  {key}");
                }
                EXIT_FAILURE
            }
        }
        InstallOutcome::GameMissing => {
            println!(
                "{}",
                "the game folder could not be found; pass --game-dir".red()
            );
            EXIT_FAILURE
        }
        InstallOutcome::GameInvalid => {
            println!(
                "{}",
                "the game folder exists but is missing the game executable".red()
            );
            EXIT_FAILURE
        }
    })
}

fn log_resource_totals(installer: &Installer) {
    for report in installer.resources().status_reports() {
        info!(
            "resource {}: {} bytes processed",
            report.name, report.total_bytes
        );
    }
}
