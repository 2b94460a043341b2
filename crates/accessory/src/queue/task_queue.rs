//! Task queue over a connection pool
//!
//! Every operation borrows one pooled connection and returns it before
//! completing. The `*_in` variants run on the caller's connection instead,
//! so inside an open transaction they nest as savepoints. Claiming a task is a read followed by a conditional update of
//! `claimed_at` inside one storage transaction; exclusivity rests on the
//! backend's transaction isolation, not on any in-process lock.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::QueueConfig;
use crate::error::Error;
use crate::pool::{ConnectionFactory, ConnectionPool, PooledConnection};
use crate::storage::{
    traced_transaction, Connection, Document, Filter, Record, Sort, StoreError, Value,
};
use crate::task::{fields, Tag, TagType, TagValue, Task};
use crate::trace::{Op, SharedTracer, TraceEvent, Tracer};

/// Why a failed task was dropped instead of rescheduled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The retry count reached `max_retries`
    RetriesExhausted,
    /// The next attempt would start after `expires_at`
    Expired,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted => f.write_str("retries exhausted"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

/// What a release did to the task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Succeeded and deleted
    Completed,
    /// Failed and scheduled for another attempt
    Rescheduled {
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// Failed for the last time and deleted
    Discarded {
        retry_count: u32,
        reason: DiscardReason,
    },
}

/// A queue of tasks in one namespace
pub struct TaskQueue<F: ConnectionFactory> {
    pub(crate) pool: Arc<ConnectionPool<F>>,
    pub(crate) config: QueueConfig,
    tracer: SharedTracer,
}

impl<F> TaskQueue<F>
where
    F: ConnectionFactory,
    F::Connection: Connection,
{
    /// Create a queue drawing connections from `pool`
    ///
    /// Queue events go to the pool's tracer.
    pub fn new(pool: Arc<ConnectionPool<F>>, config: QueueConfig) -> Result<Self, Error> {
        config.validate()?;
        let tracer = pool.tracer();
        Ok(Self {
            pool,
            config,
            tracer,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    /// Create and persist a task in this queue's namespace
    ///
    /// `scheduled_at` defaults to the creation time and, when `max_age` is
    /// configured, `expires_at` to creation time plus `max_age`. Every invalid
    /// tag is reported in one aggregate error.
    pub async fn enqueue(&self, tags: impl IntoIterator<Item = Tag>) -> Result<Task, Error> {
        let mut conn = self.connection().await?;
        self.enqueue_in(&mut conn, tags).await
    }

    /// [`enqueue`](Self::enqueue) on the caller's connection
    ///
    /// Inside an open transaction the insert nests as a savepoint and commits
    /// or rolls back with the caller's work.
    #[instrument(skip(self, conn, tags), fields(namespace = %self.config.namespace))]
    pub async fn enqueue_in(
        &self,
        conn: &mut F::Connection,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Result<Task, Error> {
        let mut task = Task::new(self.config.namespace.clone(), tags)?;
        if task.scheduled_at().is_none() {
            task.set(&TagType::ScheduledAt, Some(TagValue::Time(task.created_at())))?;
        }
        if let (None, Some(max_age)) = (task.expires_at(), self.config.max_age) {
            let expires_at = chrono::Duration::from_std(max_age)
                .ok()
                .and_then(|age| task.created_at().checked_add_signed(age))
                .ok_or_else(|| Error::bad_parameter("max_age out of range"))?;
            task.set(&TagType::ExpiresAt, Some(TagValue::Time(expires_at)))?;
        }

        let document = task.clone();
        let tracer = Arc::clone(&self.tracer);
        let result: Result<Uuid, Error> = traced_transaction(conn, &*self.tracer, move |conn| {
            Box::pin(async move {
                let started = Instant::now();
                let result = conn
                    .collection::<Task>()
                    .insert(&document)
                    .await
                    .map_err(Error::from);
                trace_op(&*tracer, Op::Insert, started, result.as_ref().err());
                result
            })
        })
        .await;

        let key = result?;
        task.set_key(key);
        debug!(%key, priority = task.priority(), "Task enqueued");
        Ok(task)
    }

    /// Claim the next eligible task
    ///
    /// Eligible means in this namespace, due, not expired, not claimed and
    /// under the retry ceiling. Higher priority wins, then earlier
    /// `scheduled_at`. Returns `None` when nothing is eligible or another
    /// worker won the claim.
    pub async fn retain(&self) -> Result<Option<Task>, Error> {
        let mut conn = self.connection().await?;
        self.retain_in(&mut conn).await
    }

    /// [`retain`](Self::retain) on the caller's connection, nesting as a
    /// savepoint inside an open transaction
    #[instrument(skip(self, conn), fields(namespace = %self.config.namespace))]
    pub async fn retain_in(&self, conn: &mut F::Connection) -> Result<Option<Task>, Error> {
        let started = Instant::now();
        let namespace = self.config.namespace.clone();
        let max_retries = self.config.max_retries;
        let tracer = Arc::clone(&self.tracer);

        let result: Result<Option<Task>, Error> =
            traced_transaction(conn, &*self.tracer, move |conn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let filter = Filter::new()
                        .eq(fields::NAMESPACE, namespace)
                        .lte(fields::SCHEDULED_AT, now)
                        .is_null(fields::CLAIMED_AT)
                        .lt(fields::RETRY_COUNT, max_retries)
                        .any(
                            Filter::new()
                                .is_null(fields::EXPIRES_AT)
                                .gt(fields::EXPIRES_AT, now),
                        );
                    let sort = Sort::new()
                        .desc(fields::PRIORITY)
                        .asc(fields::SCHEDULED_AT)
                        .limit(1);

                    let mut tasks = conn.collection::<Task>();
                    let found = Instant::now();
                    let candidate = tasks
                        .find_optional(&sort, &filter)
                        .await
                        .map_err(Error::from);
                    trace_op(&*tracer, Op::Find, found, candidate.as_ref().err());
                    let Some(mut task) = candidate? else {
                        return Ok(None);
                    };
                    let Some(key) = task.key() else {
                        return Err(Error::internal("stored task has no key"));
                    };

                    // Conditional on the claim still being free
                    let updated = Instant::now();
                    let claim = Record::new().with(fields::CLAIMED_AT, now);
                    let claimed = tasks
                        .update(claim, &Filter::key(key).is_null(fields::CLAIMED_AT))
                        .await
                        .map_err(Error::from);
                    trace_op(&*tracer, Op::Update, updated, claimed.as_ref().err());
                    if claimed?.modified == 0 {
                        debug!(%key, "Claim lost to another worker");
                        return Ok(None);
                    }
                    task.mark_claimed(now);
                    Ok(Some(task))
                })
            })
            .await;

        self.trace(Op::Retain, started, result.as_ref().err());
        if let Ok(Some(task)) = &result {
            debug!(key = ?task.key(), priority = task.priority(), "Task claimed");
        }
        result
    }

    /// Finish a claimed task
    ///
    /// `None` means success and deletes the task; a missing task is an
    /// internal error. `Some(message)` counts a failed attempt: the task is
    /// rescheduled after the backoff delay, or deleted when it has used its
    /// last retry or the next attempt would fall after `expires_at`.
    pub async fn release(
        &self,
        task: &Task,
        outcome: Option<String>,
    ) -> Result<ReleaseOutcome, Error> {
        let mut conn = self.connection().await?;
        self.release_in(&mut conn, task, outcome).await
    }

    /// [`release`](Self::release) on the caller's connection, nesting as a
    /// savepoint inside an open transaction
    #[instrument(skip(self, conn, task, outcome), fields(key = ?task.key()))]
    pub async fn release_in(
        &self,
        conn: &mut F::Connection,
        task: &Task,
        outcome: Option<String>,
    ) -> Result<ReleaseOutcome, Error> {
        let key = task
            .key()
            .ok_or_else(|| Error::bad_parameter("task has not been persisted"))?;
        let started = Instant::now();

        let result = match outcome {
            None => self.complete(conn, key).await,
            Some(message) => self.fail(conn, task, key, message).await,
        };
        self.trace(Op::Release, started, result.as_ref().err());
        result
    }

    /// Clear a claim without counting a failed attempt
    pub async fn abandon(&self, task: &Task) -> Result<(), Error> {
        let key = task
            .key()
            .ok_or_else(|| Error::bad_parameter("task has not been persisted"))?;
        let mut conn = self.connection().await?;
        let started = Instant::now();
        let result = conn
            .collection::<Task>()
            .update(
                Record::new().with(fields::CLAIMED_AT, Value::Null),
                &Filter::key(key),
            )
            .await
            .map_err(Error::from)
            .and_then(|updated| match updated.matched {
                0 => Err(Error::NotFound(format!("task {key}"))),
                _ => Ok(()),
            });
        self.trace(Op::Update, started, result.as_ref().err());
        if result.is_ok() {
            debug!(%key, "Task abandoned");
        }
        result
    }

    /// Clear claims older than `reclaim_after`, returning how many tasks
    /// became claimable again. Does nothing when `reclaim_after` is unset.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn reclaim(&self) -> Result<u64, Error> {
        let Some(after) = self.config.reclaim_after else {
            return Ok(0);
        };
        let cutoff = chrono::Duration::from_std(after)
            .ok()
            .and_then(|after| Utc::now().checked_sub_signed(after))
            .ok_or_else(|| Error::bad_parameter("reclaim_after out of range"))?;

        let started = Instant::now();
        let mut conn = self.connection().await?;
        let filter = Filter::new()
            .eq(fields::NAMESPACE, self.config.namespace.as_str())
            .lt(fields::CLAIMED_AT, cutoff);
        let result = conn
            .collection::<Task>()
            .update(Record::new().with(fields::CLAIMED_AT, Value::Null), &filter)
            .await
            .map(|updated| updated.matched)
            .map_err(Error::from);
        self.trace(Op::Reclaim, started, result.as_ref().err());

        if let Ok(count) = result {
            if count > 0 {
                info!(count, "Reclaimed stale tasks");
            }
        }
        result
    }

    /// Load a task of this namespace by key
    pub async fn get(&self, key: Uuid) -> Result<Task, Error> {
        let mut conn = self.connection().await?;
        let filter = Filter::key(key).eq(fields::NAMESPACE, self.config.namespace.as_str());
        let started = Instant::now();
        let result = match conn.collection::<Task>().find(&Sort::new(), &filter).await {
            Ok(task) => Ok(task),
            Err(StoreError::NotFound(_)) => Err(Error::NotFound(format!("task {key}"))),
            Err(e) => Err(e.into()),
        };
        self.trace(Op::Find, started, result.as_ref().err());
        result
    }

    async fn complete(
        &self,
        conn: &mut F::Connection,
        key: Uuid,
    ) -> Result<ReleaseOutcome, Error> {
        let tracer = Arc::clone(&self.tracer);
        let result: Result<(), Error> = traced_transaction(conn, &*self.tracer, move |conn| {
            Box::pin(async move { delete_claimed(conn, &*tracer, key).await })
        })
        .await;
        result?;
        debug!(%key, "Task completed");
        Ok(ReleaseOutcome::Completed)
    }

    async fn fail(
        &self,
        conn: &mut F::Connection,
        task: &Task,
        key: Uuid,
        message: String,
    ) -> Result<ReleaseOutcome, Error> {
        let retry_count = task.retry_count().saturating_add(1);
        let delay = self.config.backoff.delay_for(retry_count);
        let scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| Error::bad_parameter("backoff delay out of range"))?;

        let reason = if retry_count >= self.config.max_retries {
            Some(DiscardReason::RetriesExhausted)
        } else if task.expires_at().is_some_and(|at| scheduled_at > at) {
            Some(DiscardReason::Expired)
        } else {
            None
        };

        if let Some(reason) = reason {
            let tracer = Arc::clone(&self.tracer);
            let result: Result<(), Error> =
                traced_transaction(conn, &*self.tracer, move |conn| {
                    Box::pin(async move { delete_claimed(conn, &*tracer, key).await })
                })
                .await;
            result?;
            warn!(
                %key,
                retry_count,
                %reason,
                last_error = %message,
                "Task discarded"
            );
            return Ok(ReleaseOutcome::Discarded {
                retry_count,
                reason,
            });
        }

        let patch = Record::new()
            .with(fields::SCHEDULED_AT, scheduled_at)
            .with(fields::RETRY_COUNT, retry_count)
            .with(fields::LAST_ERROR, message.as_str())
            .with(fields::CLAIMED_AT, Value::Null);
        let tracer = Arc::clone(&self.tracer);
        let result: Result<(), Error> = traced_transaction(conn, &*self.tracer, move |conn| {
            Box::pin(async move {
                let started = Instant::now();
                let updated = conn
                    .collection::<Task>()
                    .update(patch, &Filter::key(key))
                    .await
                    .map_err(Error::from);
                trace_op(&*tracer, Op::Update, started, updated.as_ref().err());
                let updated = updated?;
                if updated.matched != 1 {
                    return Err(Error::internal(format!(
                        "released task {key} matched {} records",
                        updated.matched
                    )));
                }
                Ok(())
            })
        })
        .await;
        result?;

        debug!(%key, retry_count, %scheduled_at, error = %message, "Task rescheduled");
        Ok(ReleaseOutcome::Rescheduled {
            retry_count,
            scheduled_at,
        })
    }

    async fn connection(&self) -> Result<PooledConnection<'_, F>, Error> {
        self.pool.acquire().await.ok_or_else(|| {
            Error::ResourceExhausted(format!("no connection available for {}", self.pool.target()))
        })
    }

    fn trace(&self, op: Op, started: Instant, error: Option<&Error>) {
        trace_op(&*self.tracer, op, started, error);
    }
}

fn trace_op(tracer: &dyn Tracer, op: Op, started: Instant, error: Option<&Error>) {
    let mut event = TraceEvent::new(op, started).with_target(Task::COLLECTION);
    if let Some(err) = error {
        event = event.with_error(err);
    }
    tracer.trace(&event);
}

/// Delete one claimed task; anything but exactly one deletion means the
/// claim was broken
async fn delete_claimed<C: Connection>(
    conn: &mut C,
    tracer: &dyn Tracer,
    key: Uuid,
) -> Result<(), Error> {
    let started = Instant::now();
    let deleted = conn
        .collection::<Task>()
        .delete(&Filter::key(key))
        .await
        .map_err(Error::from);
    trace_op(tracer, Op::Delete, started, deleted.as_ref().err());
    let deleted = deleted?;
    if deleted != 1 {
        return Err(Error::internal(format!(
            "released task {key} deleted {deleted} records"
        )));
    }
    Ok(())
}

impl<F: ConnectionFactory> fmt::Debug for TaskQueue<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("namespace", &self.config.namespace)
            .field("pool", &self.pool)
            .finish()
    }
}
