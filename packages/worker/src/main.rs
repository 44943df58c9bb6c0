//! Worker process: connects to the job store and runs jobs until stopped.
//!
//! Configuration comes from the environment:
//! - `QUEUE_*` for the queue and pool (see `QueueConfig::from_env`)
//! - `DB_*` for the backend (see `DbConfig::from_env`)
//! - `WORKER_OUTPUT_DIR` root for files written by jobs (default: `./data/output`)
//! - `WORKER_SEED_DEMO` enqueue demo jobs, wait for them and exit
//! - `RUST_LOG` log filter (default: `info`)

mod jobs;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use db::{DbConfig, SurrealDriver};
use futures_util::StreamExt;
use queue_core::{CancellationToken, QueueConfig};
use remote::{LocalWorkers, RemoteQueue};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = QueueConfig::from_env()?;
    let db_config = DbConfig::from_env();
    let output_dir = std::env::var("WORKER_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/output"));
    let seed_demo = env_flag("WORKER_SEED_DEMO");

    storage::ensure_dir(&output_dir).await?;

    let driver = SurrealDriver::connect(&db_config, config.lock_timeout).await?;
    let registry = Arc::new(jobs::registry(&output_dir)?);
    let queue = Arc::new(RemoteQueue::new(
        Arc::new(driver),
        registry,
        config.clone(),
    ));
    log_events(&queue);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            cancel.cancel();
        });
    }

    let mut pool = LocalWorkers::new(config.workers, queue.clone());
    pool.start(&cancel).await?;

    if seed_demo {
        let count = jobs::seed(&queue).await?;
        tracing::info!("Seeded {} demo job(s)", count);

        if queue
            .wait_until_complete(&cancel, config.poll_interval)
            .await?
        {
            report(&queue, &output_dir).await?;
        }
        cancel.cancel();
    } else {
        tracing::info!("Serving jobs with {} worker(s); press Ctrl-C to stop", pool.size());
    }

    pool.wait().await?;
    tracing::info!("Worker stopped");
    Ok(())
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Forward queue events to the debug log.
fn log_events(queue: &RemoteQueue) {
    let mut events = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event log skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[derive(Serialize)]
struct JobSummary {
    id: String,
    job_type: String,
    completed: bool,
    errors: Vec<String>,
}

/// Print one line per job and write the same summary as JSON.
async fn report(queue: &RemoteQueue, output_dir: &Path) -> Result<(), Box<dyn Error>> {
    let mut summaries = Vec::new();
    let mut results = Box::pin(queue.results());
    while let Some(record) = results.next().await {
        let record = record?;
        let outcome = if record.errors.is_empty() {
            "ok".to_string()
        } else {
            format!("failed: {}", record.errors.join("; "))
        };
        println!("{:<40} {:<16} {}", record.id, record.job_type.to_string(), outcome);

        summaries.push(JobSummary {
            id: record.id,
            job_type: record.job_type.to_string(),
            completed: record.status.completed,
            errors: record.errors,
        });
    }

    let stats = queue.stats().await?;
    println!(
        "{} job(s): {} completed, {} with errors",
        stats.total, stats.completed, stats.errored
    );

    storage::write_json(output_dir.join("summary.json"), &summaries).await?;
    Ok(())
}
