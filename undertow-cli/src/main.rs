//! Undertow CLI - Command-line interface
//!
//! Streams simulated torrents through the piece cache and reports what the
//! cache held along the way.

mod commands;

use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Bounded piece cache for streaming torrents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level
    #[arg(long, default_value = "info", global = true)]
    log_level: CliLogLevel,

    #[command(flatten)]
    cache: commands::CacheArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    commands::handle_command(cli.command, &cli.cache).await
}
