use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hashsync_adapters::TwitterSearchClient;
use hashsync_core::{Job, JobType};
use hashsync_storage::{PgStore, Store};
use hashsync_sync::{credentials_from_env, fetch_to_file, runner_from_config, SyncConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hashsync")]
#[command(about = "Polls hashtag searches on a per-job schedule and stores the results")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the polling loop until interrupted.
    Run,
    /// Run a single scheduling cycle and exit.
    Once,
    /// Apply database migrations.
    Migrate,
    /// Register a job that becomes due immediately.
    AddJob {
        query: String,
        #[arg(long = "type", default_value = "hashtag")]
        job_type: String,
        #[arg(long, default_value_t = 60)]
        interval: i32,
    },
    /// Fetch one hashtag into a CSV file without touching the database.
    Fetch {
        hashtag: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runner = runner_from_config(&config, credentials_from_env()?).await?;
            runner.run_forever(config.poll_interval).await?;
        }
        Commands::Once => {
            let runner = runner_from_config(&config, credentials_from_env()?).await?;
            let summary = runner.run_cycle(Utc::now()).await?;
            println!(
                "cycle complete: cycle_id={} due={} completed={} skipped={} failed={} posts_stored={} files={}",
                summary.cycle_id,
                summary.due_jobs,
                summary.completed_jobs,
                summary.skipped_jobs,
                summary.failed_jobs,
                summary.posts_stored,
                summary.export_files
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            tracing::info!("migrations complete");
        }
        Commands::AddJob {
            query,
            job_type,
            interval,
        } => {
            anyhow::ensure!(interval > 0, "interval must be a positive number of minutes");
            let job_type = JobType::from(job_type.trim());
            if let JobType::Other(raw) = &job_type {
                anyhow::bail!("unknown job type {raw:?}; expected hashtag or bubble");
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let job = Job::new(query, job_type, interval, Utc::now());
            if store.insert_job(&job).await? {
                println!("registered {} job {:?} every {} min", job.job_type, job.query, interval);
            } else {
                println!("job {:?} ({}) already exists; left unchanged", job.query, job.job_type);
            }
        }
        Commands::Fetch {
            hashtag,
            output_dir,
        } => {
            let source = TwitterSearchClient::new(credentials_from_env()?, config.search_client_config())?;
            let exported = fetch_to_file(
                &source,
                output_dir.unwrap_or_else(|| config.output_dir.clone()),
                &config.extractor_config(),
                &hashtag,
            )
            .await?;
            println!("wrote {} rows to {}", exported.rows, exported.path.display());
        }
    }

    Ok(())
}
