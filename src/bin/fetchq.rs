//! fetchq CLI — operator interface to the acquisition queue.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fetchq::config::Config;
use fetchq::db::Db;
use fetchq::model::{NewWorkItem, ResetFilter, Stage, Status};
use fetchq::notify::{Notifier, TelegramNotifier, TracingNotifier};
use fetchq::queue::WorkQueue;
use fetchq::reconciler::{Reconciler, ReconcilerConfig};
use fetchq::telemetry::{TelemetryConfig, init_telemetry};
use fetchq::worker::{CommandExecutor, ExecutorSpec, WorkerConfig, WorkerLoop};

#[derive(Parser)]
#[command(name = "fetchq", about = "Claim-based two-stage work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker loop for one stage
    Worker {
        /// Pipeline stage to work (download | upload)
        stage: String,
        /// TOML executor spec describing the command to run per item
        #[arg(long)]
        executor: PathBuf,
        /// Claim batch size (overrides CLAIM_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Exit when the queue is drained instead of polling forever
        #[arg(long)]
        drain: bool,
    },
    /// Run the lease reconciler daemon
    Reconcile {
        /// Also retry failed items older than this many minutes
        #[arg(long)]
        retry_failed_mins: Option<u64>,
    },
    /// Bulk-ingest work items from a JSON file (array of {id, metadata})
    Ingest {
        /// Path to the JSON file, or "-" for stdin
        file: PathBuf,
    },
    /// Work item operations
    Item {
        #[command(subcommand)]
        action: ItemAction,
    },
    /// Show queue counts and lease health
    Stats,
    /// Reset leased (optionally failed) items back to pending
    Reset {
        /// Pipeline stage (download | upload)
        stage: String,
        /// Only reset leases held by this worker
        #[arg(long)]
        worker_id: Option<String>,
        /// Also reset aged failed items
        #[arg(long)]
        include_failed: bool,
        /// Only rows idle for at least this many minutes
        #[arg(long, default_value_t = 0)]
        max_age_mins: u64,
    },
}

#[derive(Subcommand)]
enum ItemAction {
    /// List work items
    List {
        /// Filter by stage (download | upload)
        #[arg(long)]
        stage: Option<String>,
        /// Filter by status (pending | leased | done | failed)
        #[arg(long)]
        status: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a work item
    Show {
        /// Work item ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Worker {
            stage,
            executor,
            batch_size,
            drain,
        } => cmd_worker(config, stage, executor, batch_size, drain).await,
        Command::Reconcile { retry_failed_mins } => cmd_reconcile(config, retry_failed_mins).await,
        Command::Ingest { file } => {
            let db = connect(&config).await?;
            cmd_ingest(&db, file).await
        }
        Command::Item { action } => {
            let db = connect(&config).await?;
            match action {
                ItemAction::List {
                    stage,
                    status,
                    limit,
                } => cmd_item_list(&db, stage, status, limit).await,
                ItemAction::Show { id } => cmd_item_show(&db, id).await,
            }
        }
        Command::Stats => {
            let db = connect(&config).await?;
            cmd_stats(&db).await
        }
        Command::Reset {
            stage,
            worker_id,
            include_failed,
            max_age_mins,
        } => {
            let db = connect(&config).await?;
            cmd_reset(&db, stage, worker_id, include_failed, max_age_mins).await
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone()))
        }
        _ => Arc::new(TracingNotifier),
    }
}

async fn cmd_worker(
    config: Config,
    stage: String,
    executor: PathBuf,
    batch_size: Option<usize>,
    drain: bool,
) -> anyhow::Result<()> {
    let stage: Stage = stage.parse()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "fetchq-worker".to_string(),
    })?;

    let db = connect(&config).await?;
    let spec = ExecutorSpec::load(&executor)?;

    let worker = WorkerLoop::new(
        Arc::new(db),
        Arc::new(CommandExecutor::new(spec, stage)),
        build_notifier(&config),
        WorkerConfig {
            worker_id: config.worker_id.clone(),
            stage,
            batch_size: batch_size.unwrap_or(config.claim_batch_size),
            max_retries: config.max_retries,
            retry_base: config.retry_base,
            poll_interval: config.poll_interval,
        },
    );

    if drain {
        let stats = worker.drain().await?;
        println!(
            "Drained: {} claimed, {} done, {} failed, {} released",
            stats.claimed, stats.done, stats.failed, stats.released
        );
        return Ok(());
    }

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_reconcile(config: Config, retry_failed_mins: Option<u64>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "fetchq-reconciler".to_string(),
    })?;

    let db = connect(&config).await?;

    let reconciler = Reconciler::new(
        Arc::new(db),
        build_notifier(&config),
        ReconcilerConfig {
            interval: config.reconcile_interval,
            lease_timeout: config.lease_timeout,
            failed_retry_age: retry_failed_mins.map(|mins| Duration::from_secs(mins * 60)),
        },
    );

    let handle = reconciler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    reconciler.run().await?;
    Ok(())
}

async fn cmd_ingest(db: &Db, file: PathBuf) -> anyhow::Result<()> {
    let content = if file.as_os_str() == "-" {
        use std::io::Read as _;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(&file)?
    };

    let items: Vec<NewWorkItem> = serde_json::from_str(&content)?;
    let summary = db.ingest(&items).await?;

    println!(
        "Ingested {} item(s): {} inserted, {} updated, {} skipped",
        items.len(),
        summary.inserted,
        summary.updated,
        summary.skipped
    );
    Ok(())
}

async fn cmd_item_list(
    db: &Db,
    stage: Option<String>,
    status: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let stage: Option<Stage> = stage.map(|s| s.parse()).transpose()?;
    let status: Option<Status> = status.map(|s| s.parse()).transpose()?;

    let items = db.list_items(stage, status, limit).await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:<10}  {:<16}  {:<10}  {:<16}  CREATED",
        "ID", "DOWNLOAD", "DL_LEASED_BY", "UPLOAD", "UP_LEASED_BY"
    );
    println!("{}", "-".repeat(100));

    for item in &items {
        println!(
            "{:<24}  {:<10}  {:<16}  {:<10}  {:<16}  {}",
            item.id,
            item.download.status.to_string(),
            item.download.leased_by.as_deref().unwrap_or("-"),
            item.upload.status.to_string(),
            item.upload.leased_by.as_deref().unwrap_or("-"),
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_item_show(db: &Db, id: String) -> anyhow::Result<()> {
    let item = db
        .get_item(&id)
        .await?
        .ok_or_else(|| fetchq::error::Error::NotFound(id.clone()))?;

    println!("ID:        {}", item.id);
    println!("Created:   {}", item.created_at);
    println!("Updated:   {}", item.updated_at);
    println!("Metadata:  {}", serde_json::to_string_pretty(&item.metadata)?);

    for stage in Stage::ALL {
        let state = item.stage(stage);
        println!("---");
        println!("Stage:     {stage}");
        println!("Status:    {}", state.status);
        println!("Leased By: {}", state.leased_by.as_deref().unwrap_or("-"));
        if let Some(leased_at) = state.leased_at {
            println!("Leased At: {leased_at}");
        }
        if let Some(ref payload) = state.payload {
            println!("Payload:   {}", serde_json::to_string_pretty(payload)?);
        }
        if let Some(ref error) = state.error {
            println!("Error:     {error}");
        }
    }

    Ok(())
}

async fn cmd_stats(db: &Db) -> anyhow::Result<()> {
    let stats = db.queue_stats().await?;

    println!(
        "{:<10}  {:>8}  {:>8}  {:>8}  {:>8}  {:>8}",
        "STAGE", "PENDING", "LEASED", "DONE", "FAILED", "TOTAL"
    );
    for stage in Stage::ALL {
        let counts = stats.stage(stage);
        println!(
            "{:<10}  {:>8}  {:>8}  {:>8}  {:>8}  {:>8}",
            stage.to_string(),
            counts.pending,
            counts.leased,
            counts.done,
            counts.failed,
            counts.total()
        );
    }

    if !stats.leases_by_worker.is_empty() {
        println!("\nLive leases:");
        for lease in &stats.leases_by_worker {
            println!(
                "  {:<24}  {:<10}  {}",
                lease.worker_id, lease.stage.to_string(), lease.count
            );
        }
    }

    if let Some(age) = stats.oldest_lease_age_secs {
        println!("\nOldest lease: {age}s");
    }

    Ok(())
}

async fn cmd_reset(
    db: &Db,
    stage: String,
    worker_id: Option<String>,
    include_failed: bool,
    max_age_mins: u64,
) -> anyhow::Result<()> {
    let stage: Stage = stage.parse()?;

    let count = db
        .reset(
            stage,
            ResetFilter {
                worker_id,
                include_failed,
                max_age: Duration::from_secs(max_age_mins * 60),
            },
        )
        .await?;

    println!("Reset {count} item(s) to pending");
    Ok(())
}
