use camino::Utf8PathBuf;
use clap::builder::{styling::AnsiColor, Styles};
use clap::{ColorChoice, CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    hash_file, install_modlist, verify_modlist, HashFileArgs, InstallArgs, VerifyArgs,
};
use miette::Result;
use tracing_subscriber::EnvFilter;

mod commands;
mod errors;

#[derive(Parser, Debug)]
#[command(version, about = "Reproducible modlist installer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install a modlist bundle into a target directory
    Install {
        /// Path to the .modlist bundle
        #[arg(short, long)]
        modlist: Utf8PathBuf,

        /// Directory the modlist is installed into
        #[arg(short, long)]
        install_dir: Utf8PathBuf,

        /// Directory downloaded archives live in
        #[arg(short, long)]
        downloads_dir: Utf8PathBuf,

        /// Game folder; auto-detected from the modlist's game when omitted
        #[arg(short, long)]
        game_dir: Option<Utf8PathBuf>,

        /// Native archive tool (7-Zip compatible)
        #[arg(long, default_value = "/usr/bin/7z")]
        archive_tool: Utf8PathBuf,

        /// Alternate archive tool tried when filtered extractions come back
        /// short
        #[arg(long)]
        fallback_archive_tool: Option<Utf8PathBuf>,

        /// Installer-payload extraction tool
        #[arg(long, default_value = "/usr/bin/innoextract")]
        payload_tool: Utf8PathBuf,

        /// Compatibility runner for foreign-host tools
        #[arg(long)]
        compat_runner: Option<Utf8PathBuf>,

        /// Screen width written into display inis
        #[arg(long, default_value_t = 1920)]
        screen_width: u32,

        /// Screen height written into display inis
        #[arg(long, default_value_t = 1080)]
        screen_height: u32,

        /// Resource-limit settings file (JSON)
        #[arg(long)]
        settings: Option<Utf8PathBuf>,
    },
    /// Re-hash an existing install against its modlist
    Verify {
        #[arg(short, long)]
        modlist: Utf8PathBuf,

        #[arg(short, long)]
        install_dir: Utf8PathBuf,

        #[arg(short, long)]
        downloads_dir: Utf8PathBuf,

        #[arg(long, default_value = "/usr/bin/7z")]
        archive_tool: Utf8PathBuf,

        #[arg(long, default_value = "/usr/bin/innoextract")]
        payload_tool: Utf8PathBuf,
    },
    /// Print the engine fingerprint of a file
    Hash {
        /// The file to hash
        file: Utf8PathBuf,
    },
}

fn parse_args() -> Args {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    Args::from_arg_matches(&matches).expect("failed to parse arguments")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();

    let exit_code = match args.command {
        Commands::Install {
            modlist,
            install_dir,
            downloads_dir,
            game_dir,
            archive_tool,
            fallback_archive_tool,
            payload_tool,
            compat_runner,
            screen_width,
            screen_height,
            settings,
        } => {
            install_modlist(InstallArgs {
                modlist,
                install_dir,
                downloads_dir,
                game_dir,
                archive_tool,
                fallback_archive_tool,
                payload_tool,
                compat_runner,
                screen_width,
                screen_height,
                settings,
            })
            .await?
        }
        Commands::Verify {
            modlist,
            install_dir,
            downloads_dir,
            archive_tool,
            payload_tool,
        } => {
            verify_modlist(VerifyArgs {
                modlist,
                install_dir,
                downloads_dir,
                archive_tool,
                payload_tool,
            })
            .await?
        }
        Commands::Hash { file } => hash_file(HashFileArgs { file }).await?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
