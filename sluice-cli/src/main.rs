//! Sluice CLI - Command-line interface
//!
//! Runs the stream proxy and offers one-shot diagnostics for sources and the
//! local transcoder installation.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sluice_core::RuntimeMode;
use sluice_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Stream resolution and transcoding proxy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Console log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP proxy
    Serve {
        /// Host to bind to (overrides SLUICE_BIND)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides SLUICE_BIND)
        #[arg(short, long)]
        port: Option<u16>,

        /// Runtime mode (production or development)
        #[arg(long, default_value = "production")]
        mode: RuntimeMode,
    },

    /// Follow a source's redirects and print the playback decision
    Resolve {
        /// Source URL to resolve
        url: String,
    },

    /// Report whether the configured transcoder can be launched
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    match cli.command {
        Commands::Serve { host, port, mode } => commands::serve(host, port, mode).await,
        Commands::Resolve { url } => commands::resolve(&url).await,
        Commands::Check => commands::check().await,
    }
}
