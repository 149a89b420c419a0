mod cmd;
mod config;
mod error;
mod history;
mod image;
mod progress;
mod server;
mod task;
mod tree;

#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{AnalyzeConfig, AnalyzerConfig, LogFormat, StorageConfig};

#[derive(Parser)]
#[command(name = "layer-sizes")]
#[command(about = "Per-layer directory size analysis for container images")]
#[command(version)]
struct Cli {
    /// Log filter (`info`, `debug`, `layer_sizes=trace`, ...). RUST_LOG wins
    /// when set.
    #[arg(long, global = true, env = "LAYER_SIZES_LOG", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, env = "LAYER_SIZES_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the task API that pulls and analyzes images
    Serve(AnalyzerConfig),

    /// Serve the image history API
    Storage(StorageConfig),

    /// Analyze a single image and print its layer sizes
    Analyze(AnalyzeConfig),
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log filter {level:?}"))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Commands::Serve(config) => cmd::serve::run(config).await,
        Commands::Storage(config) => cmd::storage::run(config).await,
        Commands::Analyze(config) => cmd::analyze::run(config).await,
    }
}
