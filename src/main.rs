use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use backup_warden::cli::{self, Cli};
use backup_warden::config::Settings;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // .env first so RUST_LOG from the file reaches the filter
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env().context("Failed to load configuration")?;
    let status = cli::run(cli, settings).await.context("Command failed")?;
    Ok(status.exit_code())
}
