//! Filestore service binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use filestore_core::config::FilestoreConfig;
use filestore_core::FilestoreCore;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filestore", about = "Content-addressable file metadata service")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "FILESTORE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations and exit
    Migrate,
    /// Run the core with reconciliation workers and journal pruning
    Run,
    /// Enqueue one audit sweep, drain the queue, and exit
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FilestoreConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Migrate => {
            let core = FilestoreCore::init(config).await?;
            // Migrations run during init; nothing more to do
            core.shutdown().await;
            info!("Migrations applied");
        }
        Commands::Run => {
            let core = FilestoreCore::init(config).await?;
            core.start_background().await;
            info!("Filestore running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            core.shutdown().await;
        }
        Commands::Audit => {
            let core = FilestoreCore::init(config).await?;
            let enqueued = core.reconciliation().audit_sweep().await?;
            let processed = core.reconciliation().drain_queue().await?;
            info!("Audit sweep enqueued {enqueued} jobs, processed {processed}");
            core.shutdown().await;
        }
    }

    Ok(())
}
