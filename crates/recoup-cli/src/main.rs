use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use recoup_core::NewJob;
use recoup_detect::{DetectionConfig, DetectionPipeline, JobController};
use recoup_rules::{load_seller_dataset, RuleEngine};
use recoup_storage::{FsBlobStore, JobStore, PgDetectionStore};
use recoup_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "recoup-cli")]
#[command(about = "Seller reimbursement anomaly detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consume detection jobs until Ctrl-C.
    Work,
    /// Apply database migrations.
    Migrate,
    /// Serve the read-only query API.
    Serve,
    /// Queue a detection job for a seller sync.
    Enqueue {
        #[arg(long)]
        seller: String,
        #[arg(long)]
        sync: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_attempts: Option<i32>,
    },
    /// Evaluate a dataset file offline against the rule catalog defaults.
    Detect {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DetectionConfig::from_env();

    match cli.command.unwrap_or(Commands::Work) {
        Commands::Work => work(config).await?,
        Commands::Migrate => {
            let store = PgDetectionStore::connect(&config.database_url, 2).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = PgDetectionStore::connect(&config.database_url, 5).await?;
            let blobs = FsBlobStore::new(config.evidence_dir.clone());
            let state = AppState::new(Arc::new(store), Arc::new(blobs));
            recoup_web::serve(state, config.web_port).await?;
        }
        Commands::Enqueue {
            seller,
            sync,
            priority,
            max_attempts,
        } => {
            let store = PgDetectionStore::connect(&config.database_url, 1).await?;
            let job = store
                .enqueue_job(NewJob {
                    seller_id: seller,
                    sync_id: sync,
                    priority,
                    max_attempts: max_attempts.unwrap_or(config.max_attempts),
                })
                .await
                .context("enqueueing job")?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Detect { input } => {
            let dataset = load_seller_dataset(&input)?;
            let engine = RuleEngine::new(config.load_catalog()?);
            let ctx = engine.context(&dataset, &[], Vec::new(), Utc::now());
            let evaluation = engine.evaluate(&dataset, &ctx);
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
        }
    }

    Ok(())
}

async fn work(config: DetectionConfig) -> Result<()> {
    let pool_size = (config.concurrency as u32).saturating_add(2);
    let store = Arc::new(PgDetectionStore::connect(&config.database_url, pool_size).await?);
    let blobs = Arc::new(FsBlobStore::new(config.evidence_dir.clone()));
    let engine = RuleEngine::new(config.load_catalog()?);
    info!(
        rules = ?engine.rule_types(),
        evidence_dir = %config.evidence_dir.display(),
        "rule engine ready"
    );

    let pipeline = Arc::new(DetectionPipeline::new(store.clone(), blobs, engine));
    let controller = Arc::new(JobController::new(store, pipeline, config.controller()));
    controller.start();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested, draining in-flight jobs");
    controller.stop().await;
    Ok(())
}
