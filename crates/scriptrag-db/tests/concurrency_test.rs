//! Concurrent acquire/release cycles with injected probe and close failures

mod common;

use common::{assert_quiescent_invariants, init_test_logging, test_config, MockFactory};
use scriptrag_db::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TASKS: usize = 8;
const CYCLES: usize = 50;
const MAX_SIZE: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cycles_keep_accounting_exact() {
    init_test_logging();
    // Every 7th connection fails to close; every connection fails every 4th probe
    let factory = MockFactory::flaky(7, 4);
    let config = test_config(2, MAX_SIZE)
        .with_max_idle(8)
        .with_acquire_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5));
    let pool = SimpleConnectionPool::new(config, factory.clone())
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let timeouts = Arc::new(AtomicUsize::new(0));

    // Sweeps race with the workers
    let sweeper = {
        let pool = pool.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                pool.run_health_check().await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    // Counters stay in bounds in every snapshot
    let observer = {
        let pool = pool.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let stats = pool.stats().await;
                assert!(stats.total_connections <= MAX_SIZE);
                assert!(stats.active_connections <= stats.total_connections);
                assert!(
                    stats.active_connections + stats.idle_connections <= stats.total_connections
                );
                tokio::task::yield_now().await;
            }
        })
    };

    let mut workers = Vec::with_capacity(TASKS);
    for task in 0..TASKS {
        let pool = pool.clone();
        let timeouts = timeouts.clone();
        workers.push(tokio::spawn(async move {
            for cycle in 0..CYCLES {
                if (task + cycle) % 2 == 0 {
                    match pool.acquire(Duration::from_secs(5)).await {
                        Ok(conn) => {
                            conn.query("SELECT 1", &[]).await.unwrap();
                            tokio::task::yield_now().await;
                            pool.release(conn).await;
                        }
                        Err(e) if e.is_timeout() => {
                            timeouts.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected acquire error: {e}"),
                    }
                } else {
                    match pool.get().await {
                        Ok(conn) => {
                            conn.execute("UPDATE scenes SET seen = 1", &[])
                                .await
                                .unwrap();
                            conn.release().await;
                        }
                        Err(e) if e.is_timeout() => {
                            timeouts.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected acquire error: {e}"),
                    }
                }
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    sweeper.await.unwrap();
    observer.await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_quiescent_invariants(&stats, MAX_SIZE);
    assert_eq!(
        stats.unhealthy_close_failures,
        factory.counters.close_failures() as u64
    );
    assert_eq!(
        stats.connections_closed,
        factory.counters.close_successes() as u64
    );
    assert_eq!(
        stats.total_connections,
        factory.counters.connects() - factory.counters.close_successes()
    );
    assert_eq!(
        stats.acquisitions as usize + timeouts.load(Ordering::SeqCst),
        TASKS * CYCLES
    );

    pool.close(false).await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.state, PoolState::Closed);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(
        stats.unhealthy_close_failures,
        factory.counters.close_failures() as u64
    );
    assert_eq!(
        stats.total_connections,
        factory.counters.connects() - factory.counters.close_successes()
    );
    assert_eq!(stats.total_connections, stats.leaked_connections);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_small_pool_never_exceeds_max_size() {
    let factory = MockFactory::new();
    factory.set_connect_delay(Duration::from_millis(1));
    let config = test_config(0, 2).with_acquire_timeout(Duration::from_secs(10));
    let pool = SimpleConnectionPool::new(config, factory.clone())
        .await
        .unwrap();

    let mut workers = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let conn = pool.get().await.unwrap();
                tokio::task::yield_now().await;
                conn.release().await;
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    let stats = pool.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.acquisitions, 16 * 20);
    assert!(factory.created() <= 2);
    assert_quiescent_invariants(&stats, 2);
}
