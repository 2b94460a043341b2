//! PostgreSQL storage adapter
//!
//! Each [`PostgresConnection`] wraps one dedicated `PgConnection`; pooling is
//! left to [`ConnectionPool`](crate::pool::ConnectionPool). Filters and sorts
//! compile to parameterized SQL through `QueryBuilder`. Nested transactions
//! map onto savepoints.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{
    Column, Connection as SqlxConnection, Executor, PgConnection, Postgres, QueryBuilder, Row,
    TypeInfo,
};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::query::{Condition, Direction, Filter, Sort};
use super::record::{Record, Value, KEY_FIELD};
use super::store::{assign_key, Connection, StoreError, UpdateResult};
use crate::pool::ConnectionFactory;
use crate::trace::{next_tx, redacted_url};

/// Opens [`PostgresConnection`]s to one database URL
///
/// # Example
///
/// ```ignore
/// use accessory::pool::{ConnectionPool, PoolConfig};
/// use accessory::storage::PostgresFactory;
///
/// let factory = PostgresFactory::new("postgres://localhost/tasks");
/// let pool = ConnectionPool::new(factory, PoolConfig::default());
/// ```
pub struct PostgresFactory {
    url: String,
    target: String,
}

impl PostgresFactory {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let target = redacted_url(&url);
        Self { url, target }
    }
}

impl std::fmt::Debug for PostgresFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresFactory")
            .field("target", &self.target)
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for PostgresFactory {
    type Connection = PostgresConnection;

    async fn connect(&self) -> Result<PostgresConnection, StoreError> {
        let conn = PgConnection::connect(&self.url).await.map_err(|e| {
            error!(target_url = %self.target, "Failed to connect: {}", e);
            StoreError::Database(e.to_string())
        })?;
        debug!(target_url = %self.target, "connected");
        Ok(PostgresConnection::new(conn))
    }

    async fn disconnect(&self, conn: PostgresConnection) -> Result<(), StoreError> {
        conn.close().await
    }

    fn target(&self) -> &str {
        &self.target
    }
}

/// One PostgreSQL connection with savepoint-based nested transactions
pub struct PostgresConnection {
    conn: PgConnection,
    depth: usize,
    tx_id: u64,
}

impl PostgresConnection {
    pub fn new(conn: PgConnection) -> Self {
        Self {
            conn,
            depth: 0,
            tx_id: 0,
        }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&mut self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&mut self.conn)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<(), StoreError> {
        (&mut self.conn).execute(sql).await.map_err(|e| {
            error!(tx = self.tx_id, "Failed to execute {}: {}", sql, e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }
}

/// Quote a collection or field name. Only lowercase identifiers are accepted.
fn ident(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::Database(format!("invalid identifier {name:?}")))
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(v) => {
            qb.push_bind(*v);
        }
        Value::Int(v) => {
            qb.push_bind(*v);
        }
        Value::Text(v) => {
            qb.push_bind(v.clone());
        }
        Value::Time(v) => {
            qb.push_bind(*v);
        }
        Value::Uuid(v) => {
            qb.push_bind(*v);
        }
        Value::Map(v) => {
            qb.push_bind(Json(v.clone()));
        }
    }
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    op: &str,
    value: &Value,
) -> Result<(), StoreError> {
    // Ordered comparison with NULL is never true
    if value.is_null() {
        qb.push("FALSE");
        return Ok(());
    }
    qb.push(ident(field)?).push(op);
    push_value(qb, value);
    Ok(())
}

fn push_condition(
    qb: &mut QueryBuilder<'_, Postgres>,
    condition: &Condition,
) -> Result<(), StoreError> {
    match condition {
        Condition::Eq(field, Value::Null) | Condition::IsNull(field) => {
            qb.push(ident(field)?).push(" IS NULL");
        }
        Condition::Ne(field, Value::Null) | Condition::NotNull(field) => {
            qb.push(ident(field)?).push(" IS NOT NULL");
        }
        Condition::Eq(field, value) => push_comparison(qb, field, " = ", value)?,
        Condition::Ne(field, value) => push_comparison(qb, field, " <> ", value)?,
        Condition::Lt(field, value) => push_comparison(qb, field, " < ", value)?,
        Condition::Lte(field, value) => push_comparison(qb, field, " <= ", value)?,
        Condition::Gt(field, value) => push_comparison(qb, field, " > ", value)?,
        Condition::Gte(field, value) => push_comparison(qb, field, " >= ", value)?,
        Condition::Any(alternatives) => {
            qb.push("(");
            push_conditions(qb, alternatives, " OR ", "FALSE")?;
            qb.push(")");
        }
    }
    Ok(())
}

fn push_conditions(
    qb: &mut QueryBuilder<'_, Postgres>,
    conditions: &[Condition],
    joiner: &str,
    empty: &str,
) -> Result<(), StoreError> {
    if conditions.is_empty() {
        qb.push(empty);
        return Ok(());
    }
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        push_condition(qb, condition)?;
    }
    Ok(())
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), StoreError> {
    qb.push(" WHERE ");
    push_conditions(qb, filter.conditions(), " AND ", "TRUE")
}

fn push_order(
    qb: &mut QueryBuilder<'_, Postgres>,
    sort: &Sort,
    limit: Option<u64>,
) -> Result<(), StoreError> {
    qb.push(" ORDER BY ");
    for (field, direction) in sort.fields() {
        qb.push(ident(field)?);
        qb.push(match direction {
            Direction::Asc => " ASC, ",
            Direction::Desc => " DESC, ",
        });
    }
    qb.push(ident(KEY_FIELD)?).push(" ASC");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    Ok(())
}

fn select(
    collection: &str,
    sort: &Sort,
    filter: &Filter,
    limit: Option<u64>,
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let mut qb = QueryBuilder::new("SELECT * FROM ");
    qb.push(ident(collection)?);
    push_where(&mut qb, filter)?;
    push_order(&mut qb, sort, limit)?;
    Ok(qb)
}

fn decode_row(row: &PgRow) -> Result<Record, StoreError> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value: Result<Value, sqlx::Error> = match column.type_info().name() {
            "UUID" => row.try_get::<Option<Uuid>, _>(idx).map(Value::from),
            "INT8" => row.try_get::<Option<i64>, _>(idx).map(Value::from),
            "INT4" => row.try_get::<Option<i32>, _>(idx).map(Value::from),
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .map(|v| Value::from(v.map(i64::from))),
            "BOOL" => row.try_get::<Option<bool>, _>(idx).map(Value::from),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<Option<String>, _>(idx).map(Value::from)
            }
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .map(Value::from),
            "JSON" | "JSONB" => row
                .try_get::<Option<Json<BTreeMap<String, String>>>, _>(idx)
                .map(|v| Value::from(v.map(|json| json.0))),
            other => {
                return Err(StoreError::Serialization(format!(
                    "column {} has unsupported type {other}",
                    column.name()
                )))
            }
        };
        let value = value.map_err(|e| StoreError::Serialization(e.to_string()))?;
        record.set(column.name(), value);
    }
    Ok(record)
}

fn db_error(op: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", op, e);
        StoreError::Database(e.to_string())
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.conn.ping().await.map_err(db_error("ping"))
    }

    #[instrument(skip(self, record))]
    async fn insert(&mut self, collection: &str, mut record: Record) -> Result<Uuid, StoreError> {
        let key = assign_key(&mut record);

        let mut qb = QueryBuilder::new("INSERT INTO ");
        qb.push(ident(collection)?).push(" (");
        for (i, field) in record.fields().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(ident(field)?);
        }
        qb.push(") VALUES (");
        for (i, (_, value)) in record.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            push_value(&mut qb, value);
        }
        qb.push(")");

        qb.build()
            .execute(&mut self.conn)
            .await
            .map_err(db_error("insert record"))?;

        debug!(%key, "inserted record");
        Ok(key)
    }

    #[instrument(skip(self, sort, filter))]
    async fn find(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Record, StoreError> {
        let mut qb = select(collection, sort, filter, Some(1))?;
        let row = qb
            .build()
            .fetch_optional(&mut self.conn)
            .await
            .map_err(db_error("find record"))?;

        match row {
            Some(row) => decode_row(&row),
            None => Err(StoreError::NotFound(collection.to_string())),
        }
    }

    #[instrument(skip(self, sort, filter))]
    async fn find_many(
        &mut self,
        collection: &str,
        sort: &Sort,
        filter: &Filter,
    ) -> Result<Vec<Record>, StoreError> {
        let mut qb = select(collection, sort, filter, sort.max_rows())?;
        let rows = qb
            .build()
            .fetch_all(&mut self.conn)
            .await
            .map_err(db_error("find records"))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self, patch, filter))]
    async fn update(
        &mut self,
        collection: &str,
        patch: Record,
        filter: &Filter,
    ) -> Result<UpdateResult, StoreError> {
        if patch.contains(KEY_FIELD) {
            return Err(StoreError::Database("record keys cannot be updated".into()));
        }
        if patch.is_empty() {
            let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM ");
            qb.push(ident(collection)?);
            push_where(&mut qb, filter)?;
            let matched = qb
                .build_query_scalar::<i64>()
                .fetch_one(&mut self.conn)
                .await
                .map_err(db_error("count records"))?;
            return Ok(UpdateResult {
                matched: matched as u64,
                modified: 0,
            });
        }

        let mut qb = QueryBuilder::new("UPDATE ");
        qb.push(ident(collection)?).push(" SET ");
        for (i, (field, value)) in patch.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(ident(field)?).push(" = ");
            push_value(&mut qb, value);
        }
        push_where(&mut qb, filter)?;

        let rows = qb
            .build()
            .execute(&mut self.conn)
            .await
            .map_err(db_error("update records"))?
            .rows_affected();

        Ok(UpdateResult {
            matched: rows,
            modified: rows,
        })
    }

    #[instrument(skip(self, filter))]
    async fn delete(&mut self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new("DELETE FROM ");
        qb.push(ident(collection)?);
        push_where(&mut qb, filter)?;

        let rows = qb
            .build()
            .execute(&mut self.conn)
            .await
            .map_err(db_error("delete records"))?
            .rows_affected();
        Ok(rows)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.depth == 0 {
            self.tx_id = next_tx();
            self.execute_raw("BEGIN").await?;
        } else {
            let sql = format!("SAVEPOINT sp_{}", self.depth);
            self.execute_raw(&sql).await?;
        }
        self.depth += 1;
        debug!(tx = self.tx_id, depth = self.depth, "begin");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.depth == 0 {
            return Err(StoreError::Transaction("commit without begin".into()));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.execute_raw("COMMIT").await?;
        } else {
            let sql = format!("RELEASE SAVEPOINT sp_{}", self.depth);
            self.execute_raw(&sql).await?;
        }
        debug!(tx = self.tx_id, depth = self.depth, "commit");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.depth == 0 {
            return Err(StoreError::Transaction("rollback without begin".into()));
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.execute_raw("ROLLBACK").await?;
        } else {
            let sql = format!("ROLLBACK TO SAVEPOINT sp_{}", self.depth);
            self.execute_raw(&sql).await?;
        }
        debug!(tx = self.tx_id, depth = self.depth, "rollback");
        Ok(())
    }

    fn depth(&self) -> usize {
        self.depth
    }

    async fn close(mut self) -> Result<(), StoreError> {
        if self.depth > 0 {
            self.depth = 0;
            self.execute_raw("ROLLBACK").await?;
        }
        self.conn.close().await.map_err(db_error("close connection"))
    }
}
