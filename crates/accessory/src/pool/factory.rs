//! Connection factory contract

use async_trait::async_trait;

use crate::storage::StoreError;

/// Opens and closes the connections a [`ConnectionPool`](super::ConnectionPool)
/// hands out
///
/// The pool calls `connect` lazily when it has spare capacity and no idle
/// connection, and `disconnect` for every idle connection while closing.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Close a connection the pool no longer needs
    async fn disconnect(&self, conn: Self::Connection) -> Result<(), StoreError>;

    /// Printable description of the backend, free of credentials
    fn target(&self) -> &str;
}
