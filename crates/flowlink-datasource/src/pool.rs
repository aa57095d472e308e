//! Policy-driven connection pooling
//!
//! One [`DriverPool`] is the unit of connection reuse for one data source.
//! Two capacity policies exist: `Standard` (bounded multiplexed pool,
//! defaults 50/5/5) and `SingleSession` (exactly one connection, for
//! backends where multiplexed pooling is unsafe). Every borrow issues a
//! trivial liveness probe; borrow waits are bounded and exhaustion surfaces
//! a retriable error.
//!
//! The pool captures the resolved driver's loading context as its own
//! resolution affinity, so it keeps resolving consistently after the
//! activation window that produced it has closed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};

use crate::context::LoadingContext;
use crate::descriptor::{decode_secret, ConnectionDescriptor};
use crate::error::{Error, Result};
use crate::resolver::{Connection, ResolvedDriver};

/// Default maximum active connections for a standard pool
pub const DEFAULT_MAX_ACTIVE: usize = 50;
/// Default minimum idle connections for a standard pool
pub const DEFAULT_MIN_IDLE: usize = 5;
/// Default maximum idle connections for a standard pool
pub const DEFAULT_MAX_IDLE: usize = 5;
/// Liveness probe issued on every borrow
pub const DEFAULT_VALIDATION_QUERY: &str = "select 1";

/// Capacity policy for a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolPolicy {
    /// Bounded multiplexed pool with configurable bounds
    #[default]
    Standard,
    /// Exactly one connection, for session-oriented backends
    SingleSession,
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity policy
    pub policy: PoolPolicy,
    /// Maximum active connections (Standard policy)
    pub max_active: usize,
    /// Minimum idle connections kept warm (Standard policy)
    pub min_idle: usize,
    /// Maximum idle connections retained (Standard policy)
    pub max_idle: usize,
    /// Maximum time to wait for a connection on borrow
    pub borrow_timeout: Duration,
    /// Liveness probe statement
    pub validation_query: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            policy: PoolPolicy::Standard,
            max_active: DEFAULT_MAX_ACTIVE,
            min_idle: DEFAULT_MIN_IDLE,
            max_idle: DEFAULT_MAX_IDLE,
            borrow_timeout: Duration::from_secs(30),
            validation_query: DEFAULT_VALIDATION_QUERY.to_string(),
        }
    }
}

impl PoolConfig {
    /// Standard-policy config with default bounds
    pub fn standard() -> Self {
        Self::default()
    }

    /// Single-session config; bounds are forced to (1, 1, 1)
    pub fn single_session() -> Self {
        Self {
            policy: PoolPolicy::SingleSession,
            ..Self::default()
        }
    }

    /// Set maximum active connections
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set minimum idle connections
    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Set maximum idle connections
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the borrow wait bound
    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = timeout;
        self
    }

    /// Effective (max_active, min_idle, max_idle) after applying the policy.
    ///
    /// `SingleSession` always yields (1, 1, 1) regardless of configured
    /// bounds.
    pub fn effective_bounds(&self) -> (usize, usize, usize) {
        match self.policy {
            PoolPolicy::Standard => (self.max_active.max(1), self.min_idle, self.max_idle),
            PoolPolicy::SingleSession => (1, 1, 1),
        }
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created
    pub connections_created: u64,
    /// Total connections closed
    pub connections_closed: u64,
    /// Total successful borrows
    pub borrows: u64,
    /// Number of times borrow timed out
    pub exhausted_count: u64,
    /// Number of liveness probe failures on borrow
    pub validation_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    borrows: AtomicU64,
    exhausted_count: AtomicU64,
    validation_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            borrows: self.borrows.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}

/// A managed connection pool over a resolved driver.
pub struct DriverPool {
    resolved: ResolvedDriver,
    descriptor: ConnectionDescriptor,
    secret: String,
    config: PoolConfig,
    max_active: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    semaphore: Semaphore,
    total: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

impl DriverPool {
    /// Build a pool for a resolved driver under the given config.
    ///
    /// Decodes the descriptor secret once, applies the policy to the
    /// bounds, and pre-populates `min_idle` connections. Pre-population
    /// failures are logged and tolerated; the pool lazily connects on
    /// borrow instead.
    pub async fn build(
        resolved: ResolvedDriver,
        descriptor: &ConnectionDescriptor,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        let secret = decode_secret(&descriptor.secret)?;
        let (max_active, min_idle, max_idle) = config.effective_bounds();

        tracing::info!(
            db_type = %resolved.db_type,
            policy = ?config.policy,
            max_active,
            min_idle,
            max_idle,
            "building connection pool"
        );

        let pool = Arc::new(Self {
            semaphore: Semaphore::new(max_active),
            idle: Mutex::new(Vec::with_capacity(max_active)),
            total: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            closed: AtomicBool::new(false),
            descriptor: descriptor.clone(),
            resolved,
            secret,
            max_active,
            max_idle,
            config,
        });

        for _ in 0..min_idle {
            match pool.create_connection().await {
                Ok(conn) => pool.idle.lock().await.push(conn),
                Err(e) => {
                    tracing::warn!(error = %e, "could not pre-populate idle connection");
                    break;
                }
            }
        }

        Ok(pool)
    }

    /// The capacity policy this pool was built under
    pub fn policy(&self) -> PoolPolicy {
        self.config.policy
    }

    /// Effective maximum number of active connections
    pub fn capacity(&self) -> usize {
        self.max_active
    }

    /// The loading context this pool is affined to
    pub fn context(&self) -> &Arc<LoadingContext> {
        &self.resolved.context
    }

    /// Current total connection count
    pub fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self
            .resolved
            .driver
            .connect(&self.descriptor, &self.secret)
            .await?;
        self.total.fetch_add(1, Ordering::Release);
        self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    async fn discard(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "error closing discarded connection");
        }
        self.total.fetch_sub(1, Ordering::Release);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Borrow a connection, waiting up to the configured bound.
    ///
    /// Every borrowed connection passes the liveness probe first; stale
    /// idle connections are discarded and replaced. Exceeding the wait
    /// bound surfaces `PoolExhausted` (transient, retryable).
    pub async fn borrow(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::pool_exhausted("pool is shut down"));
        }

        let start = Instant::now();
        let permit =
            tokio::time::timeout(self.config.borrow_timeout, self.semaphore.acquire())
                .await
                .map_err(|_| {
                    self.stats.exhausted_count.fetch_add(1, Ordering::Relaxed);
                    Error::pool_exhausted(format!(
                        "timeout waiting for connection ({}ms)",
                        self.config.borrow_timeout.as_millis()
                    ))
                })?
                .map_err(|_| Error::pool_exhausted("pool semaphore closed"))?;

        // Reuse an idle connection that still passes the probe.
        let conn = {
            let mut idle = self.idle.lock().await;
            loop {
                match idle.pop() {
                    Some(conn) => {
                        if conn.execute(&self.config.validation_query).await.is_ok() {
                            break Some(conn);
                        }
                        self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
                        self.discard(conn).await;
                    }
                    None => break None,
                }
            }
        };

        let conn = match conn {
            Some(conn) => conn,
            None => match self.create_connection().await {
                Ok(conn) => {
                    // A freshly created connection is probed too.
                    if let Err(e) = conn.execute(&self.config.validation_query).await {
                        self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
                        self.discard(conn).await;
                        drop(permit);
                        return Err(e);
                    }
                    conn
                }
                Err(e) => {
                    drop(permit);
                    return Err(e);
                }
            },
        };

        self.stats.borrows.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            db_type = %self.resolved.db_type,
            wait_ms = start.elapsed().as_millis() as u64,
            "borrowed connection"
        );

        // Permit travels with the connection; released on return.
        std::mem::forget(permit);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }

    async fn give_back(&self, conn: Box<dyn Connection>) {
        // The connection must land in borrower-visible state before the
        // permit is released; otherwise a waiting borrower can win the
        // permit, find `idle` empty, and open a second connection while
        // this one is still live.
        if self.closed.load(Ordering::Acquire) {
            self.discard(conn).await;
        } else {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.max_idle {
                idle.push(conn);
            } else {
                drop(idle);
                self.discard(conn).await;
            }
        }

        self.semaphore.add_permits(1);
    }

    /// Release underlying resources. Best-effort: close failures are
    /// logged, never propagated. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut idle = self.idle.lock().await;
        for conn in idle.drain(..) {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "error closing pooled connection");
            }
            self.total.fetch_sub(1, Ordering::Release);
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(db_type = %self.resolved.db_type, "connection pool closed");
    }
}

impl std::fmt::Debug for DriverPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverPool")
            .field("db_type", &self.resolved.db_type)
            .field("policy", &self.config.policy)
            .field("capacity", &self.max_active)
            .field("size", &self.size())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A connection borrowed from a [`DriverPool`]; returned on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<DriverPool>,
}

impl PooledConnection {
    /// The underlying connection
    pub fn connection(&self) -> &(dyn Connection + 'static) {
        self.conn
            .as_deref()
            .expect("connection already returned")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("returned", &self.conn.is_none())
            .field("pool", &self.pool)
            .finish()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.give_back(conn).await;
            });
        }
    }
}
