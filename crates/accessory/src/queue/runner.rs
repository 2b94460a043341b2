//! Poll loop and worker set
//!
//! One poll loop claims tasks and hands them to a fixed set of workers over a
//! bounded channel sized to the worker count. The poll loop reserves a channel
//! slot before claiming, so it never holds more claimed tasks than workers can
//! accept.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task_queue::{ReleaseOutcome, TaskQueue};
use crate::error::{Error, Errors};
use crate::pool::ConnectionFactory;
use crate::storage::Connection;
use crate::task::Task;

/// Attempts at releasing a task while the pool is exhausted
const RELEASE_ATTEMPTS: u32 = 5;

/// Type-erased task handler
pub type Handler =
    Arc<dyn Fn(TaskContext, Task) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Execution context handed to a task handler
///
/// The token is cancelled when the task's deadline passes or the runner
/// shuts down. Handlers are expected to watch it; nothing is aborted
/// preemptively.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    worker_id: usize,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the task should stop
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

impl<F> TaskQueue<F>
where
    F: ConnectionFactory,
    F::Connection: Connection,
{
    /// Claim and execute tasks until `shutdown` is cancelled
    ///
    /// Each task runs under its own child token, cancelled at the configured
    /// deadline. A handler error or panic counts as a failed attempt and is
    /// released with its message. On shutdown the poll loop stops claiming,
    /// tasks still waiting in the channel are abandoned, and `run` returns
    /// once every in-flight handler has finished.
    pub async fn run<H, Fut>(
        self: Arc<Self>,
        shutdown: CancellationToken,
        handler: H,
    ) -> Result<(), Error>
    where
        H: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if shutdown.is_cancelled() {
            return Err(Error::OutOfOrder("shutdown already requested".into()));
        }

        let handler: Handler =
            Arc::new(move |ctx: TaskContext, task: Task| handler(ctx, task).boxed());
        let workers = self.config.workers;
        let (tx, rx) = mpsc::channel::<Task>(workers);
        let rx = Arc::new(Mutex::new(rx));

        info!(
            namespace = %self.config.namespace,
            workers,
            "Starting task queue runner"
        );

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(Arc::clone(&self).worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&handler),
                shutdown.clone(),
            )));
        }

        let reclaimer = self
            .config
            .reclaim_after
            .map(|every| tokio::spawn(Arc::clone(&self).reclaim_loop(every, shutdown.clone())));

        self.poll_loop(tx, &shutdown).await;

        let mut errors = Errors::new();
        for handle in handles {
            if let Err(e) = handle.await {
                errors.push(Error::internal(format!("worker failed: {e}")));
            }
        }
        if let Some(handle) = reclaimer {
            if let Err(e) = handle.await {
                errors.push(Error::internal(format!("reclaimer failed: {e}")));
            }
        }

        info!(namespace = %self.config.namespace, "Task queue runner stopped");
        errors.into_result()
    }

    async fn poll_loop(&self, tx: mpsc::Sender<Task>, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'poll: loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                _ = ticker.tick() => {}
            }

            // Claim until the queue is empty or workers are saturated
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'poll,
                    permit = tx.reserve() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'poll,
                    },
                };

                match self.retain().await {
                    Ok(Some(task)) => permit.send(task),
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to claim task: {}", e);
                        break;
                    }
                }
            }
        }

        debug!("Poll loop exited");
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        handler: Handler,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(task) = next else {
                break;
            };

            if shutdown.is_cancelled() {
                if let Err(e) = self.abandon(&task).await {
                    warn!(worker_id, key = ?task.key(), "Failed to abandon task: {}", e);
                }
                continue;
            }

            self.execute(worker_id, &handler, task, &shutdown).await;
        }

        debug!(worker_id, "Worker exited");
    }

    async fn execute(
        &self,
        worker_id: usize,
        handler: &Handler,
        task: Task,
        shutdown: &CancellationToken,
    ) {
        let token = shutdown.child_token();
        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let ctx = TaskContext {
            token: token.clone(),
            deadline,
            worker_id,
        };
        debug!(worker_id, key = ?task.key(), "Executing task");

        let run = AssertUnwindSafe(handler(ctx, task.clone())).catch_unwind();
        tokio::pin!(run);
        let result = match deadline {
            Some(deadline) => {
                let at = tokio::time::Instant::from_std(deadline);
                match tokio::time::timeout_at(at, &mut run).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(worker_id, key = ?task.key(), "Task deadline exceeded");
                        token.cancel();
                        run.await
                    }
                }
            }
            None => run.await,
        };

        let outcome = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(panic_message(panic)),
        };
        self.release_with_retry(worker_id, &task, outcome).await;
    }

    async fn release_with_retry(&self, worker_id: usize, task: &Task, outcome: Option<String>) {
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.release(task, outcome.clone()).await {
                Ok(ReleaseOutcome::Completed) => {
                    debug!(worker_id, key = ?task.key(), "Task completed");
                    return;
                }
                Ok(ReleaseOutcome::Rescheduled {
                    retry_count,
                    scheduled_at,
                }) => {
                    info!(
                        worker_id,
                        key = ?task.key(),
                        retry_count,
                        %scheduled_at,
                        "Task failed, retry scheduled"
                    );
                    return;
                }
                Ok(ReleaseOutcome::Discarded { .. }) => return,
                Err(e) if e.is_exhausted() && attempt < RELEASE_ATTEMPTS => {
                    debug!(worker_id, attempt, "No connection to release task, waiting");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(worker_id, key = ?task.key(), "Failed to release task: {}", e);
                    return;
                }
            }
        }
    }

    async fn reclaim_loop(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reclaim().await {
                error!("Stale task reclamation failed: {}", e);
            }
        }

        debug!("Reclaim loop exited");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}
