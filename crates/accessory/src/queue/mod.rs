//! Task queue and runner
//!
//! - [`TaskQueue`]: enqueue, claim (retain) and release tasks in one namespace
//! - [`QueueConfig`]: retry ceiling, backoff, worker count, deadlines
//! - [`BackoffPolicy`]: delay before a failed task is retried
//! - [`TaskQueue::run`]: poll loop feeding a bounded set of workers

mod backoff;
mod config;
mod runner;
mod task_queue;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use config::QueueConfig;
pub use runner::{Handler, TaskContext};
pub use task_queue::{DiscardReason, ReleaseOutcome, TaskQueue};
