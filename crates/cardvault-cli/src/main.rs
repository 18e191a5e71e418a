use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cardvault_sync::{ItemOutcome, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cardvault")]
#[command(about = "Keep a local card store in sync with the remote catalogue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every catalogue card missing from the local store.
    Sync,
    /// Fetch one card by id and create or overwrite it locally.
    Import { id: String },
    /// Run `sync` on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = cardvault_sync::run_sync_once_from_env().await?;
            for item in &report.items {
                if let ItemOutcome::Failed { stage, error } = &item.outcome {
                    eprintln!("failed {} at {:?}: {}", item.id, stage, error);
                }
            }
            println!(
                "sync complete: run_id={} remote={} local={} missing={} imported={} failed={}",
                report.run_id,
                report.remote_total,
                report.local_total,
                report.missing,
                report.imported,
                report.failed
            );
        }
        Commands::Import { id } => {
            let card = cardvault_sync::import_one_from_env(&id).await?;
            println!(
                "imported {} ({}) updated_at={}",
                card.id(),
                card.card.name,
                card.updated_at.to_rfc3339()
            );
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()?
            };
            let pipeline = SyncPipeline::from_config(&config).await?;
            let Some(mut sched) =
                cardvault_sync::maybe_build_scheduler(Arc::new(pipeline), &config).await?
            else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
