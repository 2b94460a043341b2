//! Worker process configuration

use accessory::{PoolConfig, QueueConfig};
use anyhow::{Context, Result};

/// Everything the worker reads from the environment
#[derive(Debug)]
pub struct WorkerConfig {
    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Demo tasks enqueued at startup
    pub seed_tasks: usize,
    pub pool: PoolConfig,
    pub queue: QueueConfig,
}

impl WorkerConfig {
    /// Read `DATABASE_URL`, `ACCESSORY_SEED_TASKS` and the pool and queue
    /// variables. `ACCESSORY_POOL_MAX_SIZE=0` asks for an unbounded pool.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let seed_tasks = match std::env::var("ACCESSORY_SEED_TASKS") {
            Ok(value) => value
                .trim()
                .parse()
                .with_context(|| format!("ACCESSORY_SEED_TASKS: invalid count {value:?}"))?,
            Err(_) => 0,
        };

        let queue = QueueConfig::from_env().context("Invalid queue configuration")?;
        let pool = PoolConfig::from_env().context("Invalid pool configuration")?;
        let explicit = std::env::var_os("ACCESSORY_POOL_MAX_SIZE").is_some();

        Ok(Self {
            database_url,
            seed_tasks,
            pool: sized_pool(pool, &queue, explicit),
            queue,
        })
    }
}

/// Without `ACCESSORY_POOL_MAX_SIZE` the pool holds one connection per worker
/// plus one for the poll loop. An explicit value wins, and an explicit 0
/// leaves the pool unbounded.
fn sized_pool(pool: PoolConfig, queue: &QueueConfig, explicit: bool) -> PoolConfig {
    if explicit {
        pool
    } else {
        pool.with_max_size(queue.workers + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_follows_workers() {
        let queue = QueueConfig::new("q").with_workers(4);
        assert_eq!(sized_pool(PoolConfig::new(), &queue, false).max_size, 5);
    }

    #[test]
    fn test_explicit_pool_size_wins() {
        let queue = QueueConfig::new("q").with_workers(4);
        let pool = PoolConfig::new().with_max_size(2);
        assert_eq!(sized_pool(pool, &queue, true).max_size, 2);

        let unbounded = PoolConfig::new().with_max_size(0);
        assert_eq!(sized_pool(unbounded, &queue, true).max_size, 0);
    }
}
