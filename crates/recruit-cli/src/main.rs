use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use recruit_core::ParticipantCategory;
use recruit_storage::PgStore;
use recruit_sync::EngineConfig;
use recruit_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "recruit-cli")]
#[command(about = "Recruitment session state reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the summary.
    Reconcile {
        /// Evaluate as of this RFC 3339 instant instead of the wall clock.
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Show the transitions a pass would make without writing them.
    Preview {
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Rebuild participation history for one participant category.
    Backfill {
        category: ParticipantCategory,
        #[arg(long)]
        investigation: Option<Uuid>,
        /// Delete the scope's existing history first.
        #[arg(long)]
        destructive: bool,
    },
    Migrate {
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },
    /// HTTP triggers plus the cron scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Reconcile {
        now: None,
        deadline_secs: None,
    }) {
        Commands::Reconcile { now, deadline_secs } => {
            let service = recruit_sync::build_service(&config).await?;
            let deadline = deadline_secs
                .map(Duration::from_secs)
                .or(config.settings().run_deadline);
            let summary = service
                .run_reconciliation_with_deadline(now.unwrap_or_else(Utc::now), deadline)
                .await?;
            println!(
                "reconcile complete: run_id={} total={} updated={} unchanged={} errors={} skipped={}",
                summary.run_id,
                summary.total,
                summary.updated,
                summary.unchanged,
                summary.errors.len(),
                summary.skipped
            );
            for id in &summary.errors {
                println!("  error: {id}");
            }
        }
        Commands::Preview { now } => {
            let service = recruit_sync::build_service(&config).await?;
            let planned = service.preview(now.unwrap_or_else(Utc::now)).await?;
            println!("{}", serde_json::to_string_pretty(&planned)?);
        }
        Commands::Backfill {
            category,
            investigation,
            destructive,
        } => {
            let service = recruit_sync::build_service(&config).await?;
            let summary = service
                .run_history_backfill(category, destructive, investigation)
                .await?;
            println!(
                "backfill complete: run_id={} category={} candidates={} inserted={} duplicates={} deleted={}",
                summary.run_id,
                category,
                summary.candidates,
                summary.inserted,
                summary.duplicates_skipped,
                summary.deleted_before_insert
            );
        }
        Commands::Migrate { dir } => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate(&dir).await?;
            println!("migrations applied from {}", dir.display());
        }
        Commands::Serve => {
            let service = recruit_sync::build_service(&config).await?;
            let scheduler = service.maybe_build_scheduler(&config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.reconcile_cron, "reconciliation scheduler started");
            }
            recruit_web::serve(config.web_port, AppState::new(service)).await?;
        }
    }

    Ok(())
}
