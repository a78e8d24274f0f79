//! Connection pool for scriptrag-db
//!
//! A bounded pool of reusable connections with:
//! - Exact slot accounting, even when closing a connection fails
//! - Health probes on release and periodic background sweeps
//! - Bounded waits for callers when the pool is exhausted
//! - Graceful or forced shutdown
//!
//! # Accounting
//!
//! `total_connections` counts every slot the pool has handed a connection.
//! A slot is given back only when that connection's `close()` returns `Ok`.
//! If `close()` fails the connection is dropped from service but its slot
//! stays allocated, and `unhealthy_close_failures` goes up by one. The
//! pool therefore never reports more free capacity than it really has.
//!
//! # Cancellation
//!
//! Dropping an `acquire`, `release`, `close` or health check future only
//! stops the caller from waiting. The pool work behind it finishes on its
//! own task, and a connection opened for a caller that went away is put
//! back into the pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use scriptrag_db::prelude::*;
//!
//! let pool = PoolBuilder::new("sqlite://scriptrag.db")
//!     .min_size(2)
//!     .max_size(10)
//!     .build(Arc::new(SqliteConnectionFactory::default()))
//!     .await?;
//!
//! let conn = pool.get().await?;
//! let rows = conn.query("SELECT title FROM scripts", &[]).await?;
//! conn.release().await;
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Check out a connection, waiting at most `timeout` for one to free up
    async fn acquire(&self, timeout: Duration) -> Result<Box<dyn Connection>>;

    /// Return a previously acquired connection. Never fails.
    async fn release(&self, conn: Box<dyn Connection>);

    /// Consistent snapshot of pool counters
    async fn stats(&self) -> PoolStats;

    /// Shut the pool down. `force` skips waiting for checked-out connections.
    async fn close(&self, force: bool) -> Result<()>;
}

/// A connection borrowed from the pool
///
/// Dereferences to the connection. Prefer [`PooledConnection::release`];
/// dropping the guard returns the connection from a spawned task instead.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<dyn ConnectionPool>,
}

impl PooledConnection {
    /// Create a new pooled connection wrapper
    pub fn new(conn: Box<dyn Connection>, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Return the connection to the pool
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn).await;
        }
    }

    /// Take the connection back out, leaving the guard empty
    pub(crate) fn into_inner(mut self) -> Option<Box<dyn Connection>> {
        self.conn.take()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection already returned")
            .as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.release(conn).await;
                    });
                }
                Err(_) => {
                    warn!("PooledConnection dropped outside a tokio runtime; slot stays checked out");
                }
            }
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration handed to the factory
    pub connection: ConnectionConfig,
    /// Connections opened eagerly and topped up after health checks
    pub min_size: usize,
    /// Hard cap on `total_connections`
    pub max_size: usize,
    /// Capacity of the idle queue (defaults to `max_size`)
    pub max_idle: Option<usize>,
    /// Default wait used by [`SimpleConnectionPool::get`]
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer than this are closed by health checks
    pub max_idle_time: Duration,
    /// Background health check interval (zero disables the background task)
    pub health_check_interval: Duration,
    /// Upper bound on how long a graceful shutdown waits for checked-out connections
    pub shutdown_timeout: Duration,
    /// Probe idle connections before handing them out
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 1,
            max_size: 10,
            max_idle: None,
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(600), // 10 minutes
            health_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            test_on_borrow: false,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set idle queue capacity
    pub fn with_max_idle(mut self, size: usize) -> Self {
        self.max_idle = Some(size);
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum idle time
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Set health check interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Effective idle queue capacity
    pub fn idle_capacity(&self) -> usize {
        self.max_idle.unwrap_or(self.max_size).min(self.max_size)
    }

    /// Reject size combinations the pool cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_idle == Some(0) {
            return Err(Error::config("max_idle must be at least 1"));
        }
        if self.min_size > self.idle_capacity() {
            return Err(Error::config(format!(
                "min_size ({}) exceeds idle capacity ({})",
                self.min_size,
                self.idle_capacity()
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a pool instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Opening the initial `min_size` connections
    #[default]
    Initializing,
    /// Serving acquire/release
    Running,
    /// Shutdown requested, draining
    Closing,
    /// Terminal; acquire always fails
    Closed,
}

impl PoolState {
    /// Whether acquisition is refused in this state
    #[inline]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why the pool closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecycleReason {
    /// Health probe failed
    Unhealthy,
    /// Idle queue had no room on release
    PoolFull,
    /// Idle longer than `max_idle_time`
    IdleExpired,
    /// Pool is shutting down
    Shutdown,
    /// Released without a matching acquire
    Unexpected,
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::PoolFull => write!(f, "pool full"),
            Self::IdleExpired => write!(f, "idle expired"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Unexpected => write!(f, "unexpected release"),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Current lifecycle state
    pub state: PoolState,
    /// Slots owned by the pool (idle + active + slots whose close failed)
    pub total_connections: usize,
    /// Connections checked out to callers
    pub active_connections: usize,
    /// Connections waiting in the idle queue
    pub idle_connections: usize,
    /// Close attempts that returned an error
    pub unhealthy_close_failures: u64,
    /// Slots still counted after a failed close
    pub leaked_connections: usize,
    /// Total number of connections opened
    pub connections_created: u64,
    /// Total number of connections closed successfully
    pub connections_closed: u64,
    /// Total number of successful acquisitions
    pub acquisitions: u64,
    /// Number of acquisitions that timed out
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of failed health probes
    pub health_check_failures: u64,
}

/// Atomic pool metrics for concurrent updates
///
/// Purely cumulative observability counters. The accounting counters live
/// behind the pool lock and are merged in by [`ConnectionPool::stats`].
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record an acquisition timeout
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the cumulative counters
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Outcome of one health check sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    /// Idle connections examined
    pub checked: usize,
    /// Connections put back into the idle queue
    pub kept: usize,
    /// Connections closed successfully
    pub closed: usize,
    /// Connections whose close failed
    pub close_failures: usize,
    /// Connections opened to get back to `min_size`
    pub replenished: usize,
}

/// Pool builder for fluent configuration
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            config: PoolConfig::new(url),
        }
    }

    /// Set minimum pool size
    pub fn min_size(mut self, size: usize) -> Self {
        self.config.min_size = size;
        self
    }

    /// Set maximum pool size
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    /// Set idle queue capacity
    pub fn max_idle(mut self, size: usize) -> Self {
        self.config.max_idle = Some(size);
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set max idle time
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.config.max_idle_time = max_idle_time;
        self
    }

    /// Set health check interval
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Enable test on borrow
    pub fn test_on_borrow(mut self, test: bool) -> Self {
        self.config.test_on_borrow = test;
        self
    }

    /// Get the configuration
    pub fn config(self) -> PoolConfig {
        self.config
    }

    /// Build the pool
    pub async fn build(
        self,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Arc<SimpleConnectionPool>> {
        SimpleConnectionPool::new(self.config, factory).await
    }
}

// ============================================================================
// SimpleConnectionPool
// ============================================================================

/// Idle connection with its last release time
struct PoolEntry {
    conn: Box<dyn Connection>,
    last_used: Instant,
}

/// Everything guarded by the pool lock
struct PoolInner {
    /// Idle connections (LIFO for better cache locality)
    idle: Vec<PoolEntry>,
    total: usize,
    active: usize,
    close_failures: u64,
    state: PoolState,
}

/// What an acquisition attempt found under the lock
enum Checkout {
    /// A slot is already counted in `active`
    Reserved(Reservation),
    Wait,
}

/// Work still owed on a reserved slot before the caller gets a connection
enum Reservation {
    /// Idle connection awaiting its borrow test
    Borrow(PoolEntry),
    /// Fresh connection still to be opened
    Create,
}

/// Lock-guarded connection pool.
///
/// One `tokio::sync::Mutex` serializes every change to the counters and the
/// idle queue. Waiters park on a `Notify` that fires whenever a connection
/// is returned, a slot is freed, or shutdown begins.
///
/// Work that spans several awaits after the counters moved (opening a
/// reserved connection, returning one, sweeping, draining on shutdown) runs
/// on its own task. Dropping the caller's future stops the caller from
/// waiting but never leaves that work half done.
pub struct SimpleConnectionPool {
    /// Handle to the owning `Arc`, for spawning pool work
    this: Weak<Self>,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    inner: Mutex<PoolInner>,
    /// Signalled when a connection or slot becomes available
    available: Notify,
    /// Signalled when the last active connection is released
    drained: Notify,
    /// Signalled once shutdown has drained the pool
    closed: Notify,
    stats: AtomicPoolStats,
    shutdown: watch::Sender<bool>,
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    ///
    /// Opens `min_size` connections eagerly. Connection failures during
    /// warm-up are logged and leave the pool below `min_size`; only an
    /// invalid configuration fails construction.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(config.idle_capacity()),
                total: 0,
                active: 0,
                close_failures: 0,
                state: PoolState::Initializing,
            }),
            config,
            factory,
            available: Notify::new(),
            drained: Notify::new(),
            closed: Notify::new(),
            stats: AtomicPoolStats::new(),
            shutdown: shutdown_tx,
        });

        let opened = pool.fill_to_min().await;
        {
            let mut inner = pool.inner.lock().await;
            if inner.state == PoolState::Initializing {
                inner.state = PoolState::Running;
            }
        }

        info!(
            "Connection pool ready: {}/{} warm connections (max {})",
            opened, pool.config.min_size, pool.config.max_size
        );

        if !pool.config.health_check_interval.is_zero() {
            Self::spawn_health_checker(
                Arc::downgrade(&pool),
                pool.config.health_check_interval,
                shutdown_rx,
            );
        }

        Ok(pool)
    }

    /// Create a new connection pool with a builder pattern.
    pub fn builder(url: impl Into<String>) -> PoolBuilder {
        PoolBuilder::new(url)
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current lifecycle state
    pub async fn state(&self) -> PoolState {
        self.inner.lock().await.state
    }

    /// Whether shutdown has begun
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state.is_closed()
    }

    /// Acquire with the configured `acquire_timeout`, wrapped in a guard
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        self.get_timeout(self.config.acquire_timeout).await
    }

    /// Acquire with an explicit timeout, wrapped in a guard
    pub async fn get_timeout(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        let conn = self.acquire(timeout).await?;
        Ok(PooledConnection::new(conn, self.clone()))
    }

    /// Acquire without waiting. `Ok(None)` means the pool is exhausted.
    pub async fn try_acquire(&self) -> Result<Option<Box<dyn Connection>>> {
        self.checkout(None).await
    }

    /// Run one health check sweep over the idle queue.
    ///
    /// Holds the pool lock for the whole sweep, so acquire/release wait
    /// until it finishes. Afterwards tops the pool back up to `min_size`.
    pub async fn run_health_check(&self) -> HealthCheckReport {
        match self.detached(|pool| async move { pool.sweep().await }).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Health check did not complete: {}", e);
                HealthCheckReport::default()
            }
        }
    }

    async fn sweep(&self) -> HealthCheckReport {
        let mut report = HealthCheckReport::default();
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                return report;
            }

            let entries = std::mem::take(&mut inner.idle);
            let mut kept = Vec::with_capacity(entries.len());
            for entry in entries {
                report.checked += 1;
                let reason = if entry.last_used.elapsed() > self.config.max_idle_time {
                    Some(RecycleReason::IdleExpired)
                } else if !entry.conn.is_valid().await {
                    self.stats.record_health_check_failure();
                    Some(RecycleReason::Unhealthy)
                } else {
                    None
                };

                match reason {
                    None => kept.push(entry),
                    Some(reason) => {
                        let result = entry.conn.close().await;
                        if self.account_close(&mut inner, result, reason) {
                            report.closed += 1;
                        } else {
                            report.close_failures += 1;
                        }
                    }
                }
            }
            report.kept = kept.len();
            inner.idle = kept;
        }

        report.replenished = self.fill_to_min().await;
        if report.closed > 0 || report.close_failures > 0 || report.replenished > 0 {
            debug!("Health check: {:?}", report);
        }
        report
    }

    /// Spawn the periodic health checker. It stops on shutdown or once the
    /// pool is dropped.
    fn spawn_health_checker(
        pool: Weak<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.run_health_check().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Health checker stopped");
        });
    }

    /// Open connections until `total` reaches `min_size`. Best-effort:
    /// stops at the first factory error. Returns how many were opened.
    async fn fill_to_min(&self) -> usize {
        let mut opened = 0;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.state.is_closed() || inner.total >= self.config.min_size {
                    break;
                }
                inner.total += 1;
            }

            match self.open_connection().await {
                Ok(conn) => {
                    let mut inner = self.inner.lock().await;
                    if inner.state.is_closed() {
                        drop(inner);
                        self.retire(conn, RecycleReason::Shutdown).await;
                        break;
                    }
                    inner.idle.push(PoolEntry {
                        conn,
                        last_used: Instant::now(),
                    });
                    opened += 1;
                    self.available.notify_one();
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.total -= 1;
                    warn!(
                        "Could not open connection toward min_size ({}/{}): {}",
                        inner.total, self.config.min_size, e
                    );
                    break;
                }
            }
        }
        opened
    }

    async fn open_connection(&self) -> Result<Box<dyn Connection>> {
        let conn = self.factory.connect(&self.config.connection).await?;
        self.stats.record_created();
        Ok(conn)
    }

    /// Run `work` on its own task and wait for it. If the caller's future
    /// is dropped the task still runs to completion.
    async fn detached<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self
            .this
            .upgrade()
            .ok_or_else(|| Error::internal("pool dropped while in use"))?;
        Ok(tokio::spawn(work(pool)).await?)
    }

    /// Shared acquisition path. `deadline == None` never waits.
    async fn checkout(&self, deadline: Option<Instant>) -> Result<Option<Box<dyn Connection>>> {
        let start = Instant::now();

        loop {
            let mut notified = pin!(self.available.notified());

            let step = {
                let mut inner = self.inner.lock().await;
                if inner.state.is_closed() {
                    return Err(Error::PoolClosed);
                }

                if let Some(entry) = inner.idle.pop() {
                    inner.active += 1;
                    if !self.config.test_on_borrow {
                        self.stats
                            .record_acquisition(start.elapsed().as_millis() as u64);
                        return Ok(Some(entry.conn));
                    }
                    Checkout::Reserved(Reservation::Borrow(entry))
                } else if inner.total < self.config.max_size {
                    inner.total += 1;
                    inner.active += 1;
                    Checkout::Reserved(Reservation::Create)
                } else {
                    // Register before unlocking so a release in between is not missed
                    notified.as_mut().enable();
                    Checkout::Wait
                }
            };

            match step {
                Checkout::Reserved(reservation) => {
                    // A guard nobody receives releases its connection on drop
                    let outcome = self
                        .detached(move |pool| async move {
                            pool.complete(reservation).await.map(|conn| {
                                conn.map(|conn| PooledConnection::new(conn, pool.clone()))
                            })
                        })
                        .await??;

                    if let Some(conn) = outcome.and_then(PooledConnection::into_inner) {
                        self.stats
                            .record_acquisition(start.elapsed().as_millis() as u64);
                        return Ok(Some(conn));
                    }
                }
                Checkout::Wait => {
                    let Some(deadline) = deadline else {
                        return Ok(None);
                    };
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.stats.record_exhausted();
                        let waited = start.elapsed();
                        debug!("Acquire timed out after {}ms", waited.as_millis());
                        return Err(Error::acquire_timeout(waited));
                    }
                }
            }
        }
    }

    /// Settle a reserved slot. `Ok(None)` means the borrowed idle connection
    /// failed its test and was retired; the caller should try again.
    async fn complete(&self, reservation: Reservation) -> Result<Option<Box<dyn Connection>>> {
        match reservation {
            Reservation::Borrow(entry) => {
                if entry.conn.is_valid().await {
                    return Ok(Some(entry.conn));
                }
                self.stats.record_health_check_failure();
                debug!("Idle connection failed borrow test");
                {
                    let mut inner = self.inner.lock().await;
                    self.mark_released(&mut inner);
                }
                self.retire(entry.conn, RecycleReason::Unhealthy).await;
                Ok(None)
            }
            Reservation::Create => match self.open_connection().await {
                Ok(conn) => Ok(Some(conn)),
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.total -= 1;
                    self.mark_released(&mut inner);
                    self.available.notify_one();
                    Err(e)
                }
            },
        }
    }

    /// Decrement `active`, waking a graceful shutdown when it reaches zero
    fn mark_released(&self, inner: &mut MutexGuard<'_, PoolInner>) {
        inner.active -= 1;
        if inner.active == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Close a connection the pool no longer wants and settle the accounting
    async fn retire(&self, conn: Box<dyn Connection>, reason: RecycleReason) {
        let result = conn.close().await;
        let mut inner = self.inner.lock().await;
        self.account_close(&mut inner, result, reason);
    }

    /// Apply the outcome of a close attempt. Returns `true` when the slot
    /// was given back.
    fn account_close(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        result: Result<()>,
        reason: RecycleReason,
    ) -> bool {
        match result {
            Ok(()) => {
                debug_assert!(inner.total > 0, "closing a connection the pool never counted");
                inner.total = inner.total.saturating_sub(1);
                self.stats.record_closed();
                self.available.notify_one();
                debug!("Closed connection ({}), {} remaining", reason, inner.total);
                true
            }
            Err(e) => {
                inner.close_failures += 1;
                warn!(
                    "Failed to close connection ({}): {}; keeping its slot allocated ({} total, {} close failures)",
                    reason, e, inner.total, inner.close_failures
                );
                false
            }
        }
    }

    /// Close a connection that never held a slot. Only the failure is counted.
    async fn retire_untracked(&self, conn: Box<dyn Connection>) {
        if let Err(e) = conn.close().await {
            let mut inner = self.inner.lock().await;
            inner.close_failures += 1;
            warn!("Failed to close untracked connection: {}", e);
        }
    }

    /// Wait until no connections are checked out, up to `timeout`
    async fn wait_for_active(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut drained = pin!(self.drained.notified());
            {
                let inner = self.inner.lock().await;
                if inner.active == 0 {
                    return true;
                }
                drained.as_mut().enable();
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                let active = self.inner.lock().await.active;
                warn!(
                    "Shutdown timeout elapsed with {} connection(s) still checked out",
                    active
                );
                return false;
            }
        }
    }

    /// Body of [`ConnectionPool::release`]
    async fn return_connection(&self, conn: Box<dyn Connection>) {
        let closing = {
            let mut inner = self.inner.lock().await;
            if inner.active == 0 {
                drop(inner);
                warn!("Released a connection that was not checked out; closing it");
                self.retire_untracked(conn).await;
                return;
            }
            self.mark_released(&mut inner);
            inner.state.is_closed()
        };

        if closing {
            self.retire(conn, RecycleReason::Shutdown).await;
            return;
        }

        if !conn.is_valid().await {
            self.stats.record_health_check_failure();
            debug!("Released connection failed health probe");
            self.retire(conn, RecycleReason::Unhealthy).await;
            return;
        }

        let reason = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_closed() {
                RecycleReason::Shutdown
            } else if inner.idle.len() < self.config.idle_capacity() {
                inner.idle.push(PoolEntry {
                    conn,
                    last_used: Instant::now(),
                });
                self.available.notify_one();
                return;
            } else {
                RecycleReason::PoolFull
            }
        };
        self.retire(conn, reason).await;
    }

    /// Drain the pool once the state has moved to `Closing`
    async fn shut_down(&self, force: bool) {
        info!("Shutting down connection pool (force: {})", force);
        let _ = self.shutdown.send(true);
        // Waiters re-check state and fail with PoolClosed
        self.available.notify_waiters();

        if !force {
            self.wait_for_active(self.config.shutdown_timeout).await;
        }

        let mut inner = self.inner.lock().await;
        for entry in std::mem::take(&mut inner.idle) {
            let result = entry.conn.close().await;
            self.account_close(&mut inner, result, RecycleReason::Shutdown);
        }
        inner.state = PoolState::Closed;
        self.closed.notify_waiters();

        info!(
            "Connection pool closed: {} slot(s) still counted, {} active, {} close failure(s)",
            inner.total, inner.active, inner.close_failures
        );
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn acquire(&self, timeout: Duration) -> Result<Box<dyn Connection>> {
        let deadline = Instant::now() + timeout;
        match self.checkout(Some(deadline)).await? {
            Some(conn) => Ok(conn),
            None => Err(Error::acquire_timeout(timeout)),
        }
    }

    async fn release(&self, conn: Box<dyn Connection>) {
        let returned = self
            .detached(move |pool| async move { pool.return_connection(conn).await })
            .await;
        if let Err(e) = returned {
            warn!("Connection release did not complete: {}", e);
        }
    }

    async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let tracked = inner.active + inner.idle.len();
        PoolStats {
            state: inner.state,
            total_connections: inner.total,
            active_connections: inner.active,
            idle_connections: inner.idle.len(),
            unhealthy_close_failures: inner.close_failures,
            leaked_connections: inner.total.saturating_sub(tracked),
            ..self.stats.snapshot()
        }
    }

    /// A call made while another shutdown is draining waits for that drain
    /// to finish before returning.
    async fn close(&self, force: bool) -> Result<()> {
        let mut closed = pin!(self.closed.notified());
        {
            let mut inner = self.inner.lock().await;
            let state = inner.state;
            match state {
                PoolState::Closed => {
                    debug!("Pool already closed");
                    return Ok(());
                }
                PoolState::Closing => {
                    closed.as_mut().enable();
                    drop(inner);
                    debug!("Pool already closing; waiting for shutdown to finish");
                    closed.await;
                    return Ok(());
                }
                PoolState::Initializing | PoolState::Running => {
                    inner.state = PoolState::Closing;
                }
            }
        }

        self.detached(move |pool| async move { pool.shut_down(force).await })
            .await
    }
}

/// Create a connection pool from a URL with default settings.
pub async fn create_pool(
    url: impl Into<String>,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<Arc<SimpleConnectionPool>> {
    let config = PoolConfig::new(url);
    SimpleConnectionPool::new(config, factory).await
}

/// Create a connection pool with custom configuration.
pub async fn create_pool_with_config(
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
) -> Result<Arc<SimpleConnectionPool>> {
    SimpleConnectionPool::new(config, factory).await
}
