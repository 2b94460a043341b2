//! Bounded connection pool
//!
//! Connections are created lazily by a [`ConnectionFactory`] and cached on an
//! explicit free list. The checked-out count is reserved with a
//! compare-and-swap before any connection is handed out, so it never exceeds
//! `max_size` under concurrent use. An exhausted pool answers `None` at once
//! instead of waiting.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use super::config::PoolConfig;
use super::factory::ConnectionFactory;
use crate::error::{Error, Errors};
use crate::trace::{Op, SharedTracer, TraceEvent};

/// A bounded pool of connections produced by `F`
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    idle: Mutex<Vec<F::Connection>>,
    checked_out: AtomicUsize,
    draining: AtomicBool,
    max_size: usize,
    tracer: SharedTracer,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool. No connection is opened until the first `get`.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            checked_out: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            max_size: config.max_size,
            tracer: config.tracer,
        }
    }

    /// Create a pool and open one connection up front, failing when the
    /// backend cannot be reached
    pub async fn connect(factory: F, config: PoolConfig) -> Result<Self, Error> {
        let pool = Self::new(factory, config);
        let started = Instant::now();
        match pool.factory.connect().await {
            Ok(conn) => {
                pool.trace(Op::Connect, started, None);
                pool.idle.lock().push(conn);
                Ok(pool)
            }
            Err(e) => {
                let err = Error::from(e);
                pool.trace(Op::Connect, started, Some(&err));
                Err(err)
            }
        }
    }

    /// Check out a connection
    ///
    /// Returns an idle connection when there is one, otherwise opens a new
    /// one. Returns `None` when the pool is at capacity, draining, or the
    /// factory failed; the cause goes to the tracer. Treat `None` as "retry
    /// later".
    pub async fn get(&self) -> Option<F::Connection> {
        let started = Instant::now();

        if self.draining.load(Ordering::Acquire) {
            let err = Error::OutOfOrder("pool is draining".into());
            self.trace(Op::Get, started, Some(&err));
            return None;
        }

        let Some(slot) = self.reserve() else {
            let err = Error::ResourceExhausted(format!(
                "pool at capacity ({} connections)",
                self.max_size
            ));
            self.trace(Op::Get, started, Some(&err));
            return None;
        };

        let idle = self.idle.lock().pop();
        if let Some(conn) = idle {
            slot.keep();
            self.trace(Op::Get, started, None);
            return Some(conn);
        }

        // Re-check after reserving: close may have started in between
        if self.draining.load(Ordering::Acquire) {
            drop(slot);
            let err = Error::OutOfOrder("pool is draining".into());
            self.trace(Op::Get, started, Some(&err));
            return None;
        }

        // Cancelled mid-connect, `slot` drops and gives the capacity back
        match self.factory.connect().await {
            Ok(conn) => {
                slot.keep();
                self.trace(Op::Connect, started, None);
                Some(conn)
            }
            Err(e) => {
                drop(slot);
                let err = Error::from(e);
                self.trace(Op::Connect, started, Some(&err));
                None
            }
        }
    }

    /// Return a connection to the free list. `None` is ignored.
    pub fn put(&self, conn: Option<F::Connection>) {
        let Some(conn) = conn else {
            return;
        };
        let started = Instant::now();
        self.idle.lock().push(conn);
        self.unreserve();
        self.trace(Op::Put, started, None);
    }

    /// Check out a connection wrapped in a guard that puts it back on drop
    pub async fn acquire(&self) -> Option<PooledConnection<'_, F>> {
        self.get().await.map(|conn| PooledConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Drain the pool, closing every idle connection
    ///
    /// New connections are not created while draining. Connections still
    /// checked out are not recalled; any put back before the drain finishes
    /// are closed too. Every close failure is collected and returned together.
    pub async fn close(&self) -> Result<(), Error> {
        self.draining.store(true, Ordering::Release);

        let mut errors = Errors::new();
        loop {
            let next = self.idle.lock().pop();
            let Some(conn) = next else {
                break;
            };
            let started = Instant::now();
            match self.factory.disconnect(conn).await {
                Ok(()) => self.trace(Op::Disconnect, started, None),
                Err(e) => {
                    let err = Error::from(e);
                    self.trace(Op::Disconnect, started, Some(&err));
                    errors.push(err);
                }
            }
        }

        self.draining.store(false, Ordering::Release);
        errors.into_result()
    }

    /// Number of checked-out connections
    pub fn size(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }

    /// Number of idle connections on the free list
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn tracer(&self) -> SharedTracer {
        self.tracer.clone()
    }

    /// Backend description from the factory
    pub fn target(&self) -> &str {
        self.factory.target()
    }

    fn reserve(&self) -> Option<Reservation<'_, F>> {
        let max = self.max_size;
        self.checked_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Reservation {
                pool: self,
                kept: false,
            })
    }

    fn unreserve(&self) {
        if self
            .checked_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(target_url = self.target(), "connection returned that was never checked out");
        }
    }

    fn trace(&self, op: Op, started: Instant, error: Option<&Error>) {
        let mut event = TraceEvent::new(op, started).with_target(self.factory.target());
        if let Some(err) = error {
            event = event.with_error(err);
        }
        self.tracer.trace(&event);
    }
}

impl<F: ConnectionFactory> fmt::Display for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<pool target={:?} size={} idle={}",
            self.target(),
            self.size(),
            self.idle()
        )?;
        if self.max_size > 0 {
            write!(f, " max_size={}", self.max_size)?;
        }
        if self.is_draining() {
            f.write_str(" draining")?;
        }
        f.write_str(">")
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A reserved checked-out slot, given back on drop unless kept
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    kept: bool,
}

impl<F: ConnectionFactory> Reservation<'_, F> {
    /// The slot now belongs to a handed-out connection
    fn keep(mut self) {
        self.kept = true;
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.unreserve();
        }
    }
}

/// A checked-out connection, returned to its pool when dropped
pub struct PooledConnection<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<'_, F> {
    /// Take the connection out of the guard. The caller becomes responsible
    /// for returning it with [`ConnectionPool::put`].
    pub fn detach(mut self) -> Option<F::Connection> {
        self.conn.take()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<'_, F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `detach` empties the slot, and it consumes the guard
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after detach"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after detach"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        self.pool.put(self.conn.take());
    }
}
