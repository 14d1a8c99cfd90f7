// ABOUTME: CLI entry point for cdc-replicator
// ABOUTME: Parses commands and routes to the watermark and config handlers

use clap::{Parser, Subcommand};
use cdc_replicator::commands;

#[derive(Parser)]
#[command(name = "cdc-replicator")]
#[command(about = "Change-data-capture table replication to PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or edit per-table watermarks
    Watermark(commands::WatermarkArgs),
    /// Validate configuration files
    Config(commands::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log; --log defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Watermark(args) => commands::watermark::command(args).await,
        Commands::Config(args) => commands::config::command(args).await,
    }
}
