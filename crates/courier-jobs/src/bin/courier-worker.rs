//! courier-worker: runs the outbox delivery, retention and upload cleanup sweeps.
//!
//! Without a subcommand the worker runs until Ctrl-C. The one-shot
//! subcommands run a single operation and print its result as JSON.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use courier_db::{log_pool_health, Database, PoolConfig};
use courier_jobs::{
    DeliveryConfig, DeliverySweep, HttpWebhookTransport, OutboxRepository, OutboxTable,
    RetentionConfig, RetentionSweep, SweepWorker, TransportConfig, UploadRetentionConfig,
    UploadRetentionSweep, WorkerConfig, WorkerEvent,
};

#[derive(Parser)]
#[command(name = "courier-worker")]
#[command(author, version, about = "Outbox webhook delivery worker")]
#[command(propagate_version = true)]
struct Cli {
    /// Apply pending database migrations before running
    #[arg(long, env = "COURIER_MIGRATE")]
    migrate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run delivery and retention sweeps until interrupted (default)
    Run,

    /// Run one delivery sweep
    Deliver,

    /// Run one retention sweep
    Cleanup,

    /// Delete upload files older than FILE_UPLOAD_TTL_HOURS
    CleanupUploads,

    /// Return failed entries to the pending queue
    Requeue {
        /// Entry IDs to requeue
        #[arg(required = true, num_args = 1..)]
        ids: Vec<Uuid>,
    },

    /// Show entry counts per status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter (default: "courier_jobs=info,courier_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "courier_jobs=info,courier_db=info,courier_worker=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("courier-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // One-shot results go to stdout, so logs go to stderr.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env())
        .await
        .context("failed to connect to database")?;
    log_pool_health(db.pool());

    if cli.migrate {
        db.migrate().await.context("failed to apply migrations")?;
        info!("Database migrations applied");
    }

    let table = OutboxTable::from_env()?;
    let db = db.with_outbox_table(table);
    let outbox = Arc::new(db.outbox.clone());
    info!(table = table.table_name(), "Outbox table selected");

    let transport = HttpWebhookTransport::new(TransportConfig::from_env())?;
    let delivery = DeliverySweep::new(
        outbox.clone(),
        Arc::new(db.endpoints.clone()),
        Arc::new(transport),
        DeliveryConfig::from_env(),
    );
    let retention = RetentionSweep::new(outbox.clone(), RetentionConfig::from_env());
    let upload_cleanup = UploadRetentionSweep::new(
        Arc::new(db.uploads.clone()),
        UploadRetentionConfig::from_env(),
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let worker = SweepWorker::new(delivery, retention, WorkerConfig::from_env())
                .with_upload_cleanup(upload_cleanup);
            let mut events = worker.events();
            let handle = worker.start();

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            handle.shutdown().await?;

            // Let the sweep in progress finish its write phase.
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::WorkerStopped) | Err(RecvError::Closed) => break,
                    _ => continue,
                }
            }
        }
        Commands::Deliver => {
            let stats = delivery.run().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Cleanup => {
            let stats = retention.run().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::CleanupUploads => {
            let stats = upload_cleanup.run().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Requeue { ids } => {
            let count = outbox.requeue_failed(&ids, chrono::Utc::now()).await?;
            println!("{}", count);
        }
        Commands::Status => {
            let counts = outbox.status_counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}
