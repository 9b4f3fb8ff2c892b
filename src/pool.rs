//! Connection pool with guaranteed reset on checkin.
//!
//! The pool is the only shared mutable resource in the crate. A connection
//! checked out by one request and later handed to another must never carry
//! the first request's settings, so:
//!
//! - checkin (`Drop` of [`PooledConnection`]) always resets the connection
//!   (rolls back any open transaction and clears every setting)
//!   synchronously before it becomes idle again;
//! - checkout re-verifies that the connection is clean, and treats a dirty
//!   connection as a binding leak: logged at `error`, reported to the audit
//!   sink, reset, and only then handed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink};
use crate::config::PoolConfig;
use crate::engine::{Connection, ConnectionId, Database};

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No connection became free within the acquire timeout
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),
    /// Every connection is checked out
    #[error("all connections are in use")]
    Exhausted,
    /// The pool has been closed
    #[error("pool is closed")]
    Closed,
}

struct PoolInner {
    db: Database,
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    audit: Arc<dyn AuditSink>,
    closed: AtomicBool,
}

/// A fixed-size pool of physical connections.
///
/// Connections are opened lazily up to `PoolConfig::size`. Cloning the pool
/// is cheap; clones share connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.inner.config.size)
            .field("idle", &self.idle())
            .field("available", &self.available())
            .finish()
    }
}

impl Pool {
    /// Creates a pool over `db`, reporting binding leaks to `audit`.
    pub fn new(db: Database, config: PoolConfig, audit: Arc<dyn AuditSink>) -> Self {
        let permits = Arc::new(Semaphore::new(config.size));
        Self {
            inner: Arc::new(PoolInner {
                db,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
                audit,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the database the pool connects to.
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// Returns the configured number of connections.
    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    /// Returns the number of idle, already-opened connections.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Returns how many more connections can be checked out right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Checks out a connection, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// - `PoolError::Timeout` if no connection frees up in time
    /// - `PoolError::Closed` if the pool has been closed
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let timeout = self.inner.config.acquire_timeout();
        let permit = tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
            .map_err(|_| PoolError::Closed)?;
        Ok(self.checkout(permit))
    }

    /// Checks out a connection without waiting.
    ///
    /// # Errors
    ///
    /// - `PoolError::Exhausted` if every connection is in use
    /// - `PoolError::Closed` if the pool has been closed
    pub fn try_acquire(&self) -> Result<PooledConnection, PoolError> {
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Exhausted,
                TryAcquireError::Closed => PoolError::Closed,
            })?;
        Ok(self.checkout(permit))
    }

    /// Closes the pool: pending and future acquires fail, idle connections
    /// are dropped, and checked-out connections are dropped at checkin.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        self.inner.idle.lock().clear();
        tracing::debug!("connection pool closed");
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> PooledConnection {
        let reused = self.inner.idle.lock().pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self.inner.db.connect();
                tracing::debug!(connection = %conn.id(), "opened pooled connection");
                conn
            }
        };

        if !conn.is_clean() {
            tracing::error!(
                connection = %conn.id(),
                in_transaction = conn.in_transaction(),
                leaked_tenant = ?conn.current_setting(&self.inner.db.vars().tenant_var),
                "binding leak: pooled connection still carries settings at checkout"
            );
            self.inner.audit.record(
                AuditEvent::new("-", AuditEventKind::BindingLeak, AuditOutcome::Error)
                    .with_connection(conn.id())
                    .with_detail("connection reset at checkout"),
            );
            conn.reset_all();
        }

        tracing::trace!(connection = %conn.id(), "connection checked out");
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dropping it resets the connection and returns it to the pool.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Released after `Drop::drop` has pushed the connection back.
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn.as_ref().map(Connection::id))
            .finish()
    }
}

impl PooledConnection {
    /// Returns the physical connection id.
    ///
    /// Two checkouts returning the same id used the same physical
    /// connection.
    pub fn physical_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(Connection::id)
    }

    /// Returns true if no settings are bound and no transaction is open.
    pub fn is_clean(&self) -> bool {
        self.conn.as_ref().map_or(true, Connection::is_clean)
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.reset_all();
        if self.pool.closed.load(Ordering::Acquire) {
            tracing::debug!(connection = %conn.id(), "connection discarded, pool closed");
            return;
        }
        tracing::trace!(connection = %conn.id(), "connection reset and returned");
        self.pool.idle.lock().push(conn);
    }
}
