//! CLI entry point for leak-daq
//!
//! ```bash
//! leak-daq run --config config/leak_daq.toml
//! leak-daq run --mode none
//! leak-daq check-config --config config/leak_daq.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leak_daq::config::{LinkMode, MonitorConfig, DEFAULT_CONFIG_PATH};
use leak_daq::{console, logging, Monitor, MonitorError};

#[derive(Parser)]
#[command(name = "leak-daq")]
#[command(about = "Edge leak-test monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitor with an interactive command console
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the configured link driver
        #[arg(long, value_enum)]
        mode: Option<LinkMode>,
    },

    /// Load and validate the configuration, then print it as JSON
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, mode } => run(config, mode).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &Path) -> Result<MonitorConfig> {
    let config = MonitorConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("validating configuration")?;
    Ok(config)
}

async fn run(path: PathBuf, mode: Option<LinkMode>) -> Result<()> {
    let mut config = load(&path)?;
    if let Some(mode) = mode {
        config.link.mode = mode;
    }
    logging::init_from_config(&config)?;
    tracing::info!(
        name = %config.application.name,
        config = %path.display(),
        mode = ?config.link.mode,
        "Starting leak-daq"
    );

    let monitor = Monitor::from_config(&config)?;
    let console_result = tokio::select! {
        result = console::run(&monitor, tokio::io::stdin()) => result,
        signal = tokio::signal::ctrl_c() => signal.map_err(MonitorError::Io),
    };
    monitor.shutdown().await;
    console_result?;
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
