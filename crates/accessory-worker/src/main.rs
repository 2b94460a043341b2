mod config;

use std::sync::Arc;
use std::time::Duration;

use accessory::pool::{ConnectionFactory, ConnectionPool};
use accessory::queue::{TaskContext, TaskQueue};
use accessory::storage::{Connection, MemoryStore, PostgresFactory};
use accessory::task::{Tag, Task};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accessory=debug,accessory_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }
    tracing::info!("accessory-worker starting...");

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        namespace = %config.queue.namespace,
        workers = config.queue.workers,
        max_retries = config.queue.max_retries,
        "Worker configured"
    );

    match config.database_url.clone() {
        Some(url) => {
            let factory = PostgresFactory::new(url);
            let mut conn = factory
                .connect()
                .await
                .context("Failed to connect to database")?;
            conn.migrate().await.context("Failed to run migrations")?;
            conn.close().await.ok();
            serve(factory, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            serve(MemoryStore::new(), config).await
        }
    }
}

async fn serve<F>(factory: F, config: WorkerConfig) -> Result<()>
where
    F: ConnectionFactory,
    F::Connection: Connection,
{
    let pool = Arc::new(
        ConnectionPool::connect(factory, config.pool)
            .await
            .context("Failed to open connection pool")?,
    );
    tracing::info!(%pool, "Connection pool ready");

    let queue = Arc::new(
        TaskQueue::new(Arc::clone(&pool), config.queue).context("Invalid queue configuration")?,
    );

    for i in 0..config.seed_tasks {
        let tags = [
            Tag::priority((i % 10) as i64),
            Tag::custom("seq", i.to_string()),
        ];
        let task = queue.enqueue(tags).await.context("Failed to seed task")?;
        tracing::debug!(%task, "Seeded task");
    }

    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
            shutdown.cancel();
        })
    };

    let result = Arc::clone(&queue).run(shutdown.clone(), handle).await;
    signal.abort();

    if let Err(e) = pool.close().await {
        tracing::warn!(error = %e, "Errors while draining the connection pool");
    }
    result.context("Task runner failed")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Demo handler: logs the task, optionally sleeps for its `sleep_ms` tag and
/// fails when its `fail` tag is "true"
async fn handle(ctx: TaskContext, task: Task) -> Result<()> {
    tracing::info!(worker_id = ctx.worker_id(), %task, "Processing task");

    if let Some(ms) = task.tag("sleep_ms").and_then(|v| v.parse().ok()) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.cancelled() => anyhow::bail!("cancelled before finishing"),
        }
    }
    if task.tag("fail") == Some("true") {
        anyhow::bail!("task requested failure");
    }
    Ok(())
}
