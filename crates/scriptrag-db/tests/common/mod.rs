//! Shared test doubles for pool tests
//!
//! `MockFactory` hands out `MockConnection`s and keeps a handle to each
//! connection's state, so tests can flip health and close behavior after the
//! connection has disappeared into the pool.

#![allow(dead_code)]

use async_trait::async_trait;
use scriptrag_db::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("scriptrag_db=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Per-connection knobs
#[derive(Debug)]
pub struct MockState {
    pub id: usize,
    pub healthy: AtomicBool,
    pub fail_close: AtomicBool,
    pub closed: AtomicBool,
    /// Fail every n-th probe (0 = never)
    pub probe_fail_every: AtomicUsize,
    pub probes: AtomicUsize,
}

impl MockState {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counters shared by every connection a factory produced
#[derive(Debug, Default)]
pub struct MockCounters {
    pub connects: AtomicUsize,
    pub connect_failures: AtomicUsize,
    pub close_attempts: AtomicUsize,
    pub close_failures: AtomicUsize,
    pub close_successes: AtomicUsize,
    /// Every health probe sleeps this long first
    pub probe_delay_ms: AtomicUsize,
}

impl MockCounters {
    pub fn close_failures(&self) -> usize {
        self.close_failures.load(Ordering::SeqCst)
    }

    pub fn close_successes(&self) -> usize {
        self.close_successes.load(Ordering::SeqCst)
    }

    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_failures(&self) -> usize {
        self.connect_failures.load(Ordering::SeqCst)
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
    counters: Arc<MockCounters>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        if self.state.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(vec![Row::new(
            vec!["sql".into()],
            vec![Value::from(sql)],
        )])
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        if self.state.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(1)
    }

    async fn is_valid(&self) -> bool {
        if self.state.is_closed() {
            return false;
        }
        let delay = self.counters.probe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let probe = self.state.probes.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.state.probe_fail_every.load(Ordering::SeqCst);
        if every > 0 && probe % every == 0 {
            return false;
        }
        self.state.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.counters.close_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            self.counters.close_failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::connection(format!(
                "injected close failure on connection {}",
                self.state.id
            )));
        }
        self.state.closed.store(true, Ordering::SeqCst);
        self.counters.close_successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory with failure injection
#[derive(Default)]
pub struct MockFactory {
    pub counters: Arc<MockCounters>,
    states: Mutex<Vec<Arc<MockState>>>,
    fail_connect: AtomicBool,
    /// Connections whose id is a multiple of this fail to close (0 = none)
    fail_close_every: AtomicUsize,
    /// Passed on to each new connection
    probe_fail_every: AtomicUsize,
    connect_delay_ms: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `n`-th connection (by id, starting at 1) fails to close, and
    /// every connection fails every `probe_every`-th health probe.
    pub fn flaky(close_every: usize, probe_every: usize) -> Arc<Self> {
        let factory = Self::default();
        factory.fail_close_every.store(close_every, Ordering::SeqCst);
        factory.probe_fail_every.store(probe_every, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// State of the `idx`-th connection created (0-based)
    pub fn state(&self, idx: usize) -> Arc<MockState> {
        Arc::clone(&self.states.lock().unwrap()[idx])
    }

    pub fn states(&self) -> Vec<Arc<MockState>> {
        self.states.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            self.counters.connect_failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::connection("injected connect failure"));
        }

        let state = {
            let mut states = self.states.lock().unwrap();
            let id = states.len() + 1;
            let every = self.fail_close_every.load(Ordering::SeqCst);
            let state = Arc::new(MockState {
                id,
                healthy: AtomicBool::new(true),
                fail_close: AtomicBool::new(every > 0 && id % every == 0),
                closed: AtomicBool::new(false),
                probe_fail_every: AtomicUsize::new(self.probe_fail_every.load(Ordering::SeqCst)),
                probes: AtomicUsize::new(0),
            });
            states.push(Arc::clone(&state));
            state
        };
        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConnection {
            state,
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Pool config used by most tests: no background health checker, short waits
pub fn test_config(min_size: usize, max_size: usize) -> PoolConfig {
    PoolConfig::new("mock://scriptrag")
        .with_min_size(min_size)
        .with_max_size(max_size)
        .with_acquire_timeout(Duration::from_millis(200))
        .with_health_check_interval(Duration::ZERO)
        .with_shutdown_timeout(Duration::from_millis(200))
}

/// Poll `stats()` until `done` holds, failing the test after five seconds
pub async fn wait_for_stats<P, F>(pool: &P, done: F) -> PoolStats
where
    P: ConnectionPool + ?Sized,
    F: Fn(&PoolStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.stats().await;
        if done(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pool never settled: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert the accounting invariants that hold at every quiescent point
pub fn assert_quiescent_invariants(stats: &PoolStats, max_size: usize) {
    assert!(
        stats.total_connections <= max_size,
        "total {} exceeds max {}",
        stats.total_connections,
        max_size
    );
    assert!(
        stats.active_connections <= stats.total_connections,
        "active {} exceeds total {}",
        stats.active_connections,
        stats.total_connections
    );
    assert_eq!(
        stats.total_connections,
        stats.active_connections + stats.idle_connections + stats.leaked_connections
    );
}
