//! Pool behaviour under concurrency, with in-memory services.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mailwire_pool::{
    BoxError, ConnectionPool, ConnectionPoolError, MailCredentials, MailService, NoRetry,
    PoolConfig,
};
use tokio::sync::Notify;

#[derive(Debug)]
struct Session {
    id: usize,
    disconnects: Arc<AtomicUsize>,
}

impl MailService for Session {
    async fn is_alive(&mut self) -> bool {
        tokio::task::yield_now().await;
        true
    }

    async fn disconnect(&mut self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct Counters {
    created: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

fn pool(max: usize) -> (ConnectionPool<Session>, Counters) {
    let created = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counters = Counters {
        created: Arc::clone(&created),
        disconnects: Arc::clone(&disconnects),
    };
    let pool = ConnectionPool::new(
        PoolConfig::new(max).with_retry_policy(NoRetry),
        MailCredentials::new("alice", "secret"),
        move || {
            let created = Arc::clone(&created);
            let disconnects = Arc::clone(&disconnects);
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                let id = created.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, BoxError>(Session { id, disconnects })
            }
        },
        |session, _credentials| async move { Ok(session) },
    );
    (pool, counters)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bound_holds_under_contention() {
    let (pool, counters) = pool(3);

    let monitor = tokio::spawn({
        let pool = pool.clone();
        async move {
            for _ in 0..500 {
                let stats = pool.stats();
                assert!(
                    stats.available + stats.in_use <= stats.max_connections,
                    "bound exceeded: {stats:?}"
                );
                tokio::task::yield_now().await;
            }
        }
    });

    let mut workers = Vec::new();
    for _ in 0..24 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..5 {
                let session = pool.acquire().await.unwrap();
                assert!(session.id <= 3);
                tokio::time::sleep(Duration::from_millis(1)).await;
                session.release().await;
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    monitor.await.unwrap();

    assert!(counters.created.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.waiters, 0);
}

#[tokio::test]
async fn test_three_callers_two_slots() {
    let (pool, counters) = pool(2);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    let third = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.unwrap().id }
    });

    tokio::time::timeout(Duration::from_secs(1), async {
        while pool.stats().waiters == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    second.release().await;
    assert_eq!(third.await.unwrap(), 2);
    assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    drop(first);
}

#[tokio::test]
async fn test_close_during_creation() {
    let gate = Arc::new(Notify::new());
    let disconnects = Arc::new(AtomicUsize::new(0));

    let pool = ConnectionPool::new(
        PoolConfig::new(1).with_retry_policy(NoRetry),
        MailCredentials::new("alice", "secret"),
        {
            let gate = Arc::clone(&gate);
            let disconnects = Arc::clone(&disconnects);
            move || {
                let gate = Arc::clone(&gate);
                let disconnects = Arc::clone(&disconnects);
                async move {
                    gate.notified().await;
                    Ok::<_, BoxError>(Session { id: 1, disconnects })
                }
            }
        },
        |session, _| async move { Ok(session) },
    );

    let pending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|s| s.id) }
    });
    tokio::time::timeout(Duration::from_secs(1), async {
        while pool.stats().in_use == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    pool.close().await;
    gate.notify_one();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ConnectionPoolError::PoolClosed)));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_acquire_can_be_bounded_externally() {
    let (pool, _counters) = pool(1);
    let _held = pool.acquire().await.unwrap();

    let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
    assert!(attempt.is_err());
    assert_eq!(pool.stats().waiters, 0);
}

#[tokio::test]
async fn test_close_disconnects_idle_sessions() {
    let (pool, counters) = pool(2);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    a.release().await;
    b.release().await;
    assert_eq!(pool.stats().available, 2);

    pool.close().await;
    assert_eq!(counters.disconnects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().available, 0);
    assert!(matches!(pool.acquire().await, Err(ConnectionPoolError::PoolClosed)));
}
