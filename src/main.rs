//! seekd: full-text search daemon, network-serving core.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use seekd::config::{Config, LogFormat};
use seekd::Daemon;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "seekd")]
#[command(about = "Full-text search daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "seekd.toml")]
    config: PathBuf,

    /// Listen specifications overriding the config file
    #[arg(short, long)]
    listen: Vec<String>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        info!("config file {} not found, using defaults", cli.config.display());
        Config::default()
    };
    if !cli.listen.is_empty() {
        config.daemon.listen = cli.listen.clone();
    }
    config.validate()?;

    let mut logging = config.logging.clone();
    logging.level = logging.level.louder(cli.verbose);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.directive()));
    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let daemon = Daemon::start(config).await?;
    daemon.run().await
}
