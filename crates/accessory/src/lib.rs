//! # Accessory
//!
//! A storage-backed task queue with a bounded connection pool.
//!
//! ## Features
//!
//! - **Bounded connection pool**: lazily filled free list, non-blocking
//!   backpressure when full, draining close with aggregated errors
//! - **Typed tasks**: reserved tags map onto typed fields, custom tags are
//!   validated strings, every invalid tag is reported at once
//! - **Exclusive claims**: a task is claimed inside one storage transaction,
//!   so at most one worker holds it
//! - **Retries**: linear or exponential backoff, retry ceiling and expiry
//! - **Runner**: poll loop plus a fixed worker set with per-task deadlines and
//!   cooperative cancellation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TaskQueue::run                           │
//! │  (poll loop, bounded channel, workers, reclaimer)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                             │
//! │  (enqueue / retain / release inside storage transactions)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ConnectionPool                          │
//! │  (MemoryStore or PostgresFactory connections)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use accessory::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), accessory::Error> {
//! let pool = Arc::new(ConnectionPool::new(
//!     MemoryStore::new(),
//!     PoolConfig::new().with_max_size(8),
//! ));
//! let queue = Arc::new(TaskQueue::new(pool, QueueConfig::new("email"))?);
//!
//! queue.enqueue([Tag::priority(5), Tag::custom("to", "ops")]).await?;
//!
//! let shutdown = CancellationToken::new();
//! queue
//!     .run(shutdown, |_ctx, task| async move {
//!         println!("sending {task}");
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod pool;
pub mod queue;
pub mod storage;
pub mod task;
pub mod trace;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{Error, Errors};
    pub use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection};
    pub use crate::queue::{
        BackoffPolicy, DiscardReason, QueueConfig, ReleaseOutcome, TaskContext, TaskQueue,
    };
    pub use crate::storage::{
        transaction, Connection, Filter, MemoryStore, PostgresFactory, Sort, StoreError,
    };
    pub use crate::task::{Tag, TagType, TagValue, Task};
    pub use crate::trace::{LogTracer, NoopTracer, Tracer};
}

// Re-export key types at crate root
pub use error::{Error, Errors};
pub use pool::{ConnectionPool, PoolConfig};
pub use queue::{QueueConfig, TaskQueue};
pub use task::{Tag, Task};
