//! Connection pooling
//!
//! - [`ConnectionFactory`]: opens and closes backend connections
//! - [`ConnectionPool`]: bounded, lazily filled free list with draining
//! - [`PooledConnection`]: guard returning a connection on drop

mod config;
mod connection_pool;
mod factory;

pub use config::PoolConfig;
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use factory::ConnectionFactory;
