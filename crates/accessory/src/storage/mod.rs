//! Storage layer
//!
//! Provides the [`Connection`] contract the pool and queue are written
//! against, plus two adapters:
//! - [`MemoryStore`] for tests and local runs
//! - [`PostgresFactory`] for production

mod memory;
mod postgres;
mod query;
mod record;
mod store;

pub use memory::{MemoryConnection, MemoryStore};
pub use postgres::{PostgresConnection, PostgresFactory};
pub use query::{Condition, Direction, Filter, Sort};
pub use record::{Document, Record, Value, KEY_FIELD};
pub use store::{
    traced_transaction, transaction, Collection, Connection, StoreError, UpdateResult,
};
