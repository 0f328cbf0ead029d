//! Command-line frontend for the imglift migration core.

mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use imglift::MigrateConfig;

#[derive(Parser, Debug)]
#[command(
    name = "imglift",
    version,
    about = "Prepare on-premise VM disk images for cloud import"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalFlags,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Path to the migration configuration file (YAML)
    #[arg(long, global = true, env = "IMGLIFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalFlags {
    /// Load the configured, defaulted migration config.
    pub fn load_config(&self) -> anyhow::Result<MigrateConfig> {
        if let Some(path) = &self.config {
            return Ok(MigrateConfig::load(path)?);
        }
        if let Some(default) = dirs::config_dir().map(|d| d.join("imglift/config.yaml")) {
            if default.exists() {
                return Ok(MigrateConfig::load(&default)?);
            }
        }
        Ok(MigrateConfig::default())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and report an image's header without touching the host
    Inspect(commands::inspect::InspectArgs),
    /// Run the full migration pipeline against an image
    Prepare(commands::prepare::PrepareArgs),
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_directive = match verbose {
        0 => "imglift=info,imglift_cli=info",
        1 => "imglift=debug,imglift_cli=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match cli.command {
        Command::Inspect(args) => commands::inspect::execute(args, &cli.global),
        Command::Prepare(args) => commands::prepare::execute(args, &cli.global),
    }
}
