//! workvault CLI: operator interface to a queue and record store.
//!
//! Every command opens the data directory directly. Run queue commands only
//! while no `serve` process holds the same directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workvault::config::Config;
use workvault::engine::WorkerPool;
use workvault::handler::HandlerRegistry;
use workvault::model::NewJob;
use workvault::queue::DurableQueue;
use workvault::records::ShardedRecordStore;
use workvault::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workvault", about = "Durable job queue and record store")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool until interrupted
    Serve {
        /// Directory containing handler TOML files
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
        /// Number of concurrent workers (overrides config)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Append a job to the queue
    Enqueue {
        /// Job kind (selects the handler)
        kind: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Attempts before the job is dead-lettered
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show queue counters
    Stats,
    /// List dead-lettered jobs
    DeadLetters {
        /// Maximum entries to show, most recent last
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop finished entries from the queue log
    Compact,
    /// Record store operations
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// Print one record as JSON
    Get {
        entity_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Serve { handlers, workers } => cmd_serve(config, handlers, workers).await,
        Command::Enqueue {
            kind,
            payload,
            max_attempts,
        } => cmd_enqueue(&config, kind, payload, max_attempts).await,
        Command::Stats => cmd_stats(&config).await,
        Command::DeadLetters { limit } => cmd_dead_letters(&config, limit).await,
        Command::Compact => {
            let queue = open_queue(&config).await?;
            if queue.compact().await? {
                println!("Compacted: generation {}", queue.stats().await.generation);
            } else {
                println!("Nothing to compact.");
            }
            Ok(())
        }
        Command::Record {
            action: RecordAction::Get { entity_id },
        } => cmd_record_get(&config, entity_id).await,
    }
}

async fn open_queue(config: &Config) -> anyhow::Result<DurableQueue> {
    Ok(DurableQueue::open(config.queue_dir(), config.queue.clone()).await?)
}

async fn cmd_serve(
    mut config: Config,
    handlers: PathBuf,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;
    if let Some(workers) = workers {
        config.workers.workers = workers;
    }

    let registry = HandlerRegistry::load_from_dir(&handlers)?;
    let queue = Arc::new(open_queue(&config).await?);
    let pool = WorkerPool::new(queue, Arc::new(registry), config.workers.clone())?;

    let shutdown = pool.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_enqueue(
    config: &Config,
    kind: String,
    payload: Option<String>,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let mut new = NewJob::new(kind, payload);
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    let queue = open_queue(config).await?;
    let id = queue.enqueue(new).await?;
    println!("Enqueued: {id}");
    Ok(())
}

async fn cmd_stats(config: &Config) -> anyhow::Result<()> {
    let stats = open_queue(config).await?.stats().await;
    println!("Queued:      {}", stats.queued);
    println!("In flight:   {}", stats.inflight);
    println!("Retrying:    {}", stats.waiting_retry);
    println!("Done:        {}", stats.done);
    println!("Dead:        {}", stats.dead);
    println!("Log:         {} entries, {} bytes", stats.log_entries, stats.log_bytes);
    println!("Generation:  {}", stats.generation);
    Ok(())
}

async fn cmd_dead_letters(config: &Config, limit: usize) -> anyhow::Result<()> {
    let letters = open_queue(config).await?.dead_letters(limit).await?;
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!("{:<36}  {:<16}  {:<8}  {:<16}  ERROR", "ID", "KIND", "ATTEMPTS", "FAILED");
    println!("{}", "-".repeat(100));
    for letter in &letters {
        println!(
            "{:<36}  {:<16}  {:<8}  {:<16}  {}",
            letter.job.id,
            letter.job.kind,
            letter.job.attempts,
            letter.failed_at.format("%Y-%m-%d %H:%M"),
            letter.final_error
        );
    }
    println!("\n{} dead letter(s)", letters.len());
    Ok(())
}

async fn cmd_record_get(config: &Config, entity_id: String) -> anyhow::Result<()> {
    let store: ShardedRecordStore<serde_json::Value> =
        ShardedRecordStore::open(config.records_dir(), &config.records).await?;
    match store.get(&entity_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => anyhow::bail!("no record for entity '{entity_id}'"),
    }
    Ok(())
}
