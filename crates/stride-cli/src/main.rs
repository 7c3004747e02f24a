use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "stride-cli")]
#[command(about = "Strava raw activity ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh tokens and ingest every athlete's activities once
    Sync,
    /// Create the raw schema and tables if missing
    Migrate,
    /// Serve the OAuth callback endpoint
    Serve,
    /// Load the newest exported snapshot file for one athlete
    LoadSnapshot {
        #[arg(long, default_value = "data/raw")]
        dir: PathBuf,
        #[arg(long)]
        athlete_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = stride_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} athletes={} rows={} failed={} extracted_at={}",
                summary.run_id,
                summary.athletes,
                summary.rows_written,
                summary.failures.len(),
                summary.extracted_at.to_rfc3339()
            );
            for failure in &summary.failures {
                println!("[{}] ERROR: {}", failure.athlete_id, failure.message);
            }
        }
        Commands::Migrate => {
            stride_sync::migrate_from_env().await?;
            println!("schema ready");
        }
        Commands::Serve => {
            stride_web::serve_from_env().await?;
        }
        Commands::LoadSnapshot { dir, athlete_id } => {
            let load = stride_sync::snapshot::load_latest_snapshot_from_env(&dir, athlete_id).await?;
            println!(
                "loaded {} activities for athlete {} from {} (extracted_at={})",
                load.rows_written,
                athlete_id,
                load.path.display(),
                load.extracted_at.to_rfc3339()
            );
        }
    }

    Ok(())
}
