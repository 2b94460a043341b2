//! In-memory storage adapter
//!
//! Backs tests and local runs. A top-level transaction holds the store lock
//! for its whole lifetime, so transactions on different connections are
//! serialized. Nested transactions snapshot the data and restore the
//! snapshot on rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::query::{Filter, Sort};
use super::record::{Record, KEY_FIELD};
use super::store::{assign_key, Connection, StoreError, UpdateResult};
use crate::pool::ConnectionFactory;
use crate::trace::next_tx;

type Collections = HashMap<String, BTreeMap<Uuid, Record>>;

/// Shared in-memory store. Clones share the same data.
///
/// # Example
///
/// ```
/// use accessory::storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// let conn = store.connection();
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Collections>>,
    closed: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to this store
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            data: Arc::clone(&self.data),
            closed: Arc::clone(&self.closed),
            tx: None,
            savepoints: Vec::new(),
            tx_id: 0,
        }
    }

    /// Number of records in `collection`
    pub async fn count(&self, collection: &str) -> usize {
        self.data
            .lock()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Make the backend unavailable (or available again). While unavailable,
    /// connecting and every connection operation fail with
    /// [`StoreError::Closed`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.closed.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.connection())
    }

    async fn disconnect(&self, conn: MemoryConnection) -> Result<(), StoreError> {
        conn.close().await
    }

    fn target(&self) -> &str {
        "memory"
    }
}

/// Connection to a [`MemoryStore`]
pub struct MemoryConnection {
    data: Arc<Mutex<Collections>>,
    closed: Arc<AtomicBool>,
    /// Held from the outermost `begin` until its commit or rollback
    tx: Option<OwnedMutexGuard<Collections>>,
    /// One snapshot per open transaction level, outermost first
    savepoints: Vec<Collections>,
    tx_id: u64,
}

impl MemoryConnection {
    async fn with_data<R, F>(&mut self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Collections) -> R + Send,
        R: Send,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        match self.tx.as_mut() {
            Some(guard) => Ok(f(&mut **guard)),
            None => {
                let mut guard = self.data.lock().await;
                Ok(f(&mut *guard))
            }
        }
    }

    async fn matching(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Vec<Record>, StoreError> {
        self.with_data(|data| {
            let mut records: Vec<Record> = data
                .get(collection)
                .map(|records| {
                    records
                        .values()
                        .filter(|r| filter.matches(r))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            sort.apply(&mut records);
            records
        })
        .await
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.with_data(|_| ()).await
    }

    async fn insert(&mut self, collection: &str, mut record: Record) -> Result<Uuid, StoreError> {
        let key = assign_key(&mut record);
        self.with_data(|data| {
            let records = data.entry(collection.to_string()).or_default();
            if records.contains_key(&key) {
                return Err(StoreError::Database(format!(
                    "duplicate key {key} in {collection}"
                )));
            }
            records.insert(key, record);
            Ok(key)
        })
        .await?
    }

    async fn find(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Record, StoreError> {
        let sort = sort.clone().limit(1);
        self.matching(collection, &sort, filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(collection.to_string()))
    }

    async fn find_many(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Vec<Record>, StoreError> {
        self.matching(collection, sort, filter).await
    }

    async fn update(
        &mut self,
        collection: &str,
        patch: Record,
        filter: &Filter,
    ) -> Result<UpdateResult, StoreError> {
        if patch.contains(KEY_FIELD) {
            return Err(StoreError::Database("record keys cannot be updated".into()));
        }
        self.with_data(|data| {
            let mut result = UpdateResult::default();
            let Some(records) = data.get_mut(collection) else {
                return result;
            };
            for record in records.values_mut().filter(|r| filter.matches(r)) {
                result.matched += 1;
                let mut changed = false;
                for (field, value) in patch.iter() {
                    if record.get(field) != value {
                        record.set(field.clone(), value.clone());
                        changed = true;
                    }
                }
                if changed {
                    result.modified += 1;
                }
            }
            result
        })
        .await
    }

    async fn delete(&mut self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        self.with_data(|data| {
            let Some(records) = data.get_mut(collection) else {
                return 0;
            };
            let before = records.len();
            records.retain(|_, r| !filter.matches(r));
            (before - records.len()) as u64
        })
        .await
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        match self.tx.as_ref() {
            Some(guard) => {
                let snapshot = Collections::clone(guard);
                self.savepoints.push(snapshot);
            }
            None => {
                let guard = Arc::clone(&self.data).lock_owned().await;
                self.savepoints.push(Collections::clone(&guard));
                self.tx = Some(guard);
                self.tx_id = next_tx();
            }
        }
        debug!(tx = self.tx_id, depth = self.depth(), "begin");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.savepoints.pop().is_none() {
            return Err(StoreError::Transaction("commit without begin".into()));
        }
        debug!(tx = self.tx_id, depth = self.depth(), "commit");
        if self.savepoints.is_empty() {
            self.tx = None;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let Some(snapshot) = self.savepoints.pop() else {
            return Err(StoreError::Transaction("rollback without begin".into()));
        };
        if let Some(guard) = self.tx.as_mut() {
            **guard = snapshot;
        }
        debug!(tx = self.tx_id, depth = self.depth(), "rollback");
        if self.savepoints.is_empty() {
            self.tx = None;
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.savepoints.len()
    }

    async fn close(mut self) -> Result<(), StoreError> {
        if !self.savepoints.is_empty() {
            self.abort();
            return Err(StoreError::Transaction(
                "connection closed with an open transaction".into(),
            ));
        }
        Ok(())
    }
}

impl MemoryConnection {
    /// Undo every open transaction level
    fn abort(&mut self) {
        if let Some(guard) = self.tx.as_mut() {
            if !self.savepoints.is_empty() {
                **guard = self.savepoints.swap_remove(0);
            }
        }
        self.savepoints.clear();
        self.tx = None;
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transaction;
    use crate::Error;

    const PEOPLE: &str = "people";

    fn person(name: &str, age: i64) -> Record {
        Record::new().with("name", name).with("age", age)
    }

    #[tokio::test]
    async fn test_insert_assigns_key_and_find() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        let key = conn.insert(PEOPLE, person("ada", 36)).await.unwrap();
        let found = conn
            .find(PEOPLE, &Sort::new(), &Filter::key(key))
            .await
            .unwrap();

        assert_eq!(found.key(), Some(key));
        assert_eq!(found.get("name").as_text(), Some("ada"));
        assert_eq!(store.count(PEOPLE).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        let key = Uuid::now_v7();
        conn.insert(PEOPLE, person("a", 1).with(KEY_FIELD, key))
            .await
            .unwrap();
        let result = conn.insert(PEOPLE, person("b", 2).with(KEY_FIELD, key)).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_find_not_found() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        let result = conn.find(PEOPLE, &Sort::new(), &Filter::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_find_many_filters_and_sorts() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        for (name, age) in [("a", 30), ("b", 40), ("c", 20), ("d", 50)] {
            conn.insert(PEOPLE, person(name, age)).await.unwrap();
        }

        let records = conn
            .find_many(
                PEOPLE,
                &Sort::new().desc("age").limit(2),
                &Filter::new().lt("age", 50i64),
            )
            .await
            .unwrap();

        let names: Vec<_> = records
            .iter()
            .map(|r| r.get("name").as_text().unwrap())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_update_counts_matched_and_modified() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        conn.insert(PEOPLE, person("a", 30)).await.unwrap();
        conn.insert(PEOPLE, person("b", 31)).await.unwrap();

        let result = conn
            .update(PEOPLE, Record::new().with("age", 30i64), &Filter::new())
            .await
            .unwrap();

        assert_eq!(result.matched, 2);
        assert_eq!(result.modified, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_key_change() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        let patch = Record::new().with(KEY_FIELD, Uuid::now_v7());
        let result = conn.update(PEOPLE, patch, &Filter::new()).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        conn.insert(PEOPLE, person("a", 30)).await.unwrap();
        conn.insert(PEOPLE, person("b", 40)).await.unwrap();

        let deleted = conn
            .delete(PEOPLE, &Filter::new().gte("age", 35i64))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count(PEOPLE).await, 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback_restores_data() {
        let store = MemoryStore::new();
        let mut conn = store.connection();
        conn.insert(PEOPLE, person("a", 30)).await.unwrap();

        let result: Result<(), Error> = transaction(&mut conn, |conn| {
            Box::pin(async move {
                conn.insert(PEOPLE, person("b", 40)).await?;
                Err(Error::internal("abort"))
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(conn.depth(), 0);
        assert_eq!(store.count(PEOPLE).await, 1);
    }

    #[tokio::test]
    async fn test_nested_rollback_keeps_outer_changes() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        conn.begin().await.unwrap();
        conn.insert(PEOPLE, person("outer", 1)).await.unwrap();

        conn.begin().await.unwrap();
        assert_eq!(conn.depth(), 2);
        conn.insert(PEOPLE, person("inner", 2)).await.unwrap();
        conn.rollback().await.unwrap();

        conn.commit().await.unwrap();
        assert_eq!(conn.depth(), 0);

        let records = conn
            .find_many(PEOPLE, &Sort::new(), &Filter::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("name").as_text(), Some("outer"));
    }

    #[tokio::test]
    async fn test_commit_without_begin() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        assert!(matches!(
            conn.commit().await,
            Err(StoreError::Transaction(_))
        ));
        assert!(matches!(
            conn.rollback().await,
            Err(StoreError::Transaction(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_connection_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut conn = store.connection();
            conn.begin().await.unwrap();
            conn.insert(PEOPLE, person("a", 1)).await.unwrap();
        }
        assert_eq!(store.count(PEOPLE).await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        let mut conn = store.connection();

        store.set_unavailable(true);
        assert!(matches!(conn.ping().await, Err(StoreError::Closed)));
        assert!(matches!(store.connect().await, Err(StoreError::Closed)));

        store.set_unavailable(false);
        conn.ping().await.unwrap();
    }
}
