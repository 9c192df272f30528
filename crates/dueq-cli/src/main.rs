//! dueq - durable work queue CLI
//!
//! Postgres に接続して worker / reaper / cleanup を起動したり、
//! 運用コマンド（migrate, enqueue, sweep, cleanup, stats）を一回だけ実行します。
//!
//! 設定は環境変数（`DATABASE_URL` / `DB_*` / `DUEQ_*`）から読みます。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::PgPool;

use dueq_core::app::AppBuilder;
use dueq_core::impls::{PgNotifyWake, PostgresWorkStore, connect_pool};
use dueq_core::observability;
use dueq_core::ports::{ExecutionError, SideEffect, SystemClock, UlidGenerator, WorkStore};
use dueq_core::{NewWorkItem, PayloadRef, Queue, QueueConfig, QueueError, WorkItem};

/// dueq - durable at-least-once work queue
#[derive(Parser, Debug)]
#[command(name = "dueq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create tables and indexes (idempotent)
    Migrate,

    /// Insert a work item
    Enqueue {
        /// Subject the work is about; one uncompleted item per subject
        #[arg(long)]
        subject: String,

        /// Actor owning the subject
        #[arg(long)]
        owner: String,

        /// When the item becomes due (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Opaque JSON handed to the side effect
        #[arg(long)]
        payload: Option<String>,
    },

    /// Run worker loops plus the reaper and cleanup loops until Ctrl-C
    Worker {
        /// Number of worker loops (overrides DUEQ_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Reclaim expired leases and enforce the retry cap once
    Sweep,

    /// Archive terminal items older than the ttl once
    Cleanup {
        /// Overrides DUEQ_TTL_DAYS
        #[arg(long)]
        ttl_days: Option<u32>,
    },

    /// Print per-status counts as JSON
    Stats,
}

/// Side effect bundled with the CLI: logs each item and succeeds.
///
/// Deployments link their own `SideEffect` through `AppBuilder`.
struct LogSideEffect;

#[async_trait]
impl SideEffect for LogSideEffect {
    async fn execute(&self, item: &WorkItem) -> Result<(), ExecutionError> {
        tracing::info!(
            item_id = %item.id,
            subject_id = %item.payload_ref.subject_id,
            owner_id = %item.payload_ref.owner_id,
            retry_count = item.retry_count,
            payload = %item.payload,
            "work item due"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(cli.json_logs);

    let mut config = QueueConfig::from_env().context("loading configuration")?;
    if let Commands::Worker {
        workers: Some(n), ..
    } = &cli.command
    {
        config.workers = *n;
    }
    if let Commands::Cleanup {
        ttl_days: Some(days),
    } = &cli.command
    {
        config.ttl_days = *days;
    }
    config.validate().context("validating configuration")?;

    let pool = connect_with_retry(&config).await?;
    let store = Arc::new(
        PostgresWorkStore::new(pool.clone(), Arc::new(UlidGenerator::new(SystemClock)))
            .with_schema(config.schema.clone()),
    );
    let wake = Arc::new(PgNotifyWake::new(pool.clone(), config.wake_channel.clone()));
    let queue = Queue::from_config(store.clone(), &config).with_wake(wake.clone());

    match cli.command {
        Commands::Migrate => {
            store.migrate().await.context("running migrations")?;
            tracing::info!(schema = %config.schema, "schema ready");
        }
        Commands::Enqueue {
            subject,
            owner,
            at,
            payload,
        } => {
            let mut new = NewWorkItem::new(PayloadRef::new(subject, owner), at.unwrap_or_else(Utc::now));
            if let Some(raw) = payload {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).context("--payload is not valid JSON")?;
                new = new.with_payload(value);
            }
            let id = queue.enqueue(new).await.context("enqueue")?;
            println!("{id}");
        }
        Commands::Worker { .. } => {
            tracing::info!(schema = %config.schema, channel = wake.channel(), "starting workers");
            let app = AppBuilder::new()
                .store(store)
                .wake(wake)
                .executor(Arc::new(LogSideEffect))
                .config(config)
                .build()
                .context("building app")?;
            let handle = app.spawn();

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            tracing::info!("shutdown requested");
            handle.shutdown_and_join().await;
        }
        Commands::Sweep => {
            let report = queue.sweep().await.context("sweep")?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Cleanup { .. } => {
            let report = queue.cleanup(config.ttl()).await.context("cleanup")?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Stats => {
            let counts = store.counts().await.context("stats")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    pool.close().await;
    Ok(())
}

/// The database may come up after us (compose, k8s). Retry with doubling
/// delay, 1s up to 30s. Configuration errors are not retried.
async fn connect_with_retry(config: &QueueConfig) -> Result<PgPool> {
    const MAX_DELAY: Duration = Duration::from_secs(30);
    let mut delay = Duration::from_secs(1);
    loop {
        match connect_pool(config).await {
            Ok(pool) => return Ok(pool),
            Err(e @ QueueError::Config(_)) => return Err(e).context("connecting to Postgres"),
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?delay, "database connect failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}
