use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod cli;

use cli::{cmd_check_config, cmd_run, init_logging};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level; defaults to `log.level` from the configuration
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the browser and run the enabled automations until Ctrl-C
    Run,
    /// Print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = pagepilot::load_config(cli.config.as_deref()).await?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| loaded.config.log.level.clone());
    init_logging(&level, cli.debug, loaded.config.log.json)?;

    info!("Starting PagePilot v{}", env!("CARGO_PKG_VERSION"));
    if loaded.from_file {
        info!("Loaded configuration from: {}", loaded.path.display());
    } else {
        warn!(
            "Config file not found, using defaults: {}",
            loaded.path.display()
        );
    }

    let result = match cli.command {
        Commands::Run => cmd_run(loaded.config).await,
        Commands::CheckConfig => cmd_check_config(&loaded),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
