//! Storage adapter contract

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;
use uuid::Uuid;

use super::query::{Filter, Sort};
use super::record::{Document, Record, KEY_FIELD};
use crate::error::Error;
use crate::trace::{next_tx, NoopTracer, Op, TraceEvent, Tracer};

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record matched the filter
    #[error("record not found in {0}")]
    NotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// A record could not be mapped to or from its Rust type
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Begin/commit/rollback used out of order
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The connection has been closed
    #[error("connection closed")]
    Closed,
}

/// Counts reported by an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Records matching the filter
    pub matched: u64,
    /// Records whose content changed. Adapters that cannot tell the two apart
    /// report `matched` here.
    pub modified: u64,
}

/// A single backend connection
///
/// Transactions nest: `begin` while a transaction is open starts a savepoint
/// that the matching `commit` releases and `rollback` undoes.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Round-trip to the backend
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Insert a record, assigning a key when it has none. Returns the key.
    async fn insert(&mut self, collection: &str, record: Record) -> Result<Uuid, StoreError>;

    /// First record matching `filter` in `sort` order
    async fn find(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Record, StoreError>;

    /// Every record matching `filter` in `sort` order
    async fn find_many(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Vec<Record>, StoreError>;

    /// Set every field of `patch` on each record matching `filter`
    async fn update(
        &mut self,
        collection: &str,
        patch: Record,
        filter: &Filter,
    ) -> Result<UpdateResult, StoreError>;

    /// Delete records matching `filter`, returning how many were removed
    async fn delete(&mut self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Current transaction nesting depth; 0 outside any transaction
    fn depth(&self) -> usize;

    /// Close the underlying connection
    async fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Typed view of the collection backing `D`
    fn collection<D: Document>(&mut self) -> Collection<'_, Self, D>
    where
        Self: Sized,
    {
        Collection {
            conn: self,
            _document: PhantomData,
        }
    }
}

/// Key of `record`, generating a time-ordered one when missing
pub(crate) fn assign_key(record: &mut Record) -> Uuid {
    match record.key() {
        Some(key) => key,
        None => {
            let key = Uuid::now_v7();
            record.set(KEY_FIELD, key);
            key
        }
    }
}

/// Collection handle that maps records to and from `D`
pub struct Collection<'c, C: ?Sized, D> {
    conn: &'c mut C,
    _document: PhantomData<fn() -> D>,
}

impl<C: Connection, D: Document> Collection<'_, C, D> {
    pub async fn insert(&mut self, document: &D) -> Result<Uuid, StoreError> {
        self.conn.insert(D::COLLECTION, document.to_record()).await
    }

    pub async fn find(&mut self, sort: &Sort, filter: &Filter) -> Result<D, StoreError> {
        let record = self.conn.find(D::COLLECTION, sort, filter).await?;
        D::from_record(record)
    }

    /// Like [`find`](Self::find), mapping "not found" to `None`
    pub async fn find_optional(
        &mut self,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Option<D>, StoreError> {
        match self.find(sort, filter).await {
            Ok(document) => Ok(Some(document)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn find_many(&mut self, sort: &Sort, filter: &Filter) -> Result<Vec<D>, StoreError> {
        self.conn
            .find_many(D::COLLECTION, sort, filter)
            .await?
            .into_iter()
            .map(D::from_record)
            .collect()
    }

    pub async fn update(
        &mut self,
        patch: Record,
        filter: &Filter,
    ) -> Result<UpdateResult, StoreError> {
        self.conn.update(D::COLLECTION, patch, filter).await
    }

    pub async fn delete(&mut self, filter: &Filter) -> Result<u64, StoreError> {
        self.conn.delete(D::COLLECTION, filter).await
    }
}

impl<C: ?Sized, D: Document> fmt::Debug for Collection<'_, C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &D::COLLECTION)
            .finish()
    }
}

/// Run `f` inside a transaction on `conn`
///
/// Commits when `f` succeeds and rolls back when it fails. Called while a
/// transaction is already open, this nests as a savepoint.
///
/// ```ignore
/// let deleted = transaction(&mut conn, move |conn| {
///     Box::pin(async move { Ok(conn.delete("tasks", &filter).await?) })
/// })
/// .await?;
/// ```
pub async fn transaction<C, T, E, F>(conn: &mut C, f: F) -> Result<T, E>
where
    C: Connection,
    T: Send,
    E: From<StoreError> + fmt::Display + Send,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T, E>> + Send,
{
    traced_transaction(conn, &NoopTracer, f).await
}

/// [`transaction`] reporting begin, commit and rollback to `tracer`, each
/// event carrying the transaction's number
pub async fn traced_transaction<C, T, E, F>(
    conn: &mut C,
    tracer: &dyn Tracer,
    f: F,
) -> Result<T, E>
where
    C: Connection,
    T: Send,
    E: From<StoreError> + fmt::Display + Send,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T, E>> + Send,
{
    let tx = next_tx();

    let started = Instant::now();
    let begun = conn.begin().await;
    trace_tx(tracer, Op::Begin, tx, started, begun.as_ref().err());
    begun?;

    match f(conn).await {
        Ok(value) => {
            let started = Instant::now();
            let committed = conn.commit().await;
            trace_tx(tracer, Op::Commit, tx, started, committed.as_ref().err());
            committed?;
            Ok(value)
        }
        Err(err) => {
            let started = Instant::now();
            let rolled_back = conn.rollback().await;
            trace_tx(tracer, Op::Rollback, tx, started, rolled_back.as_ref().err());
            if let Err(rollback_err) = rolled_back {
                warn!(tx, error = %err, rollback_error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

fn trace_tx(
    tracer: &dyn Tracer,
    op: Op,
    tx: u64,
    started: Instant,
    error: Option<&StoreError>,
) {
    let error = error.map(|e| Error::Store(StoreError::Transaction(e.to_string())));
    let mut event = TraceEvent::new(op, started).with_tx(tx);
    if let Some(err) = &error {
        event = event.with_error(err);
    }
    tracer.trace(&event);
}
