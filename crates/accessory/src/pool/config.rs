//! Pool configuration

use std::fmt;

use crate::error::Error;
use crate::trace::{default_tracer, SharedTracer, Tracer};

/// Connection pool configuration
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of checked-out connections; 0 means unbounded
    pub max_size: usize,

    /// Observer for every pool operation
    pub tracer: SharedTracer,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            tracer: default_tracer(),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum pool size (0 = unbounded)
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the tracer
    pub fn with_tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.tracer = std::sync::Arc::new(tracer);
        self
    }

    /// Set an already shared tracer
    pub fn with_shared_tracer(mut self, tracer: SharedTracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Read `ACCESSORY_POOL_MAX_SIZE`, falling back to the defaults
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("ACCESSORY_POOL_MAX_SIZE") {
            config.max_size = value.parse().map_err(|_| {
                Error::bad_parameter(format!("ACCESSORY_POOL_MAX_SIZE: invalid size {value:?}"))
            })?;
        }
        Ok(config)
    }
}
