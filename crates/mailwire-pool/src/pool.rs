//! Bounded pool of authenticated mail services.
//!
//! The pool never holds more than `max_connections` services, counting
//! both idle ones and ones lent out. A slot is reserved under the lock
//! before a service is created, so concurrent callers cannot overshoot the
//! bound while a connection is still being established.
//!
//! When the pool is full, callers queue up in FIFO order. A returned
//! service goes straight to the oldest waiter; a returned service that
//! turned out to be dead hands its slot to that waiter instead, which then
//! creates a replacement.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;

use crate::config::{MailCredentials, PoolConfig};
use crate::error::{BoxError, ConnectionPoolError, Result};
use crate::service::{BoxFuture, MailService};

type Factory<S> = Box<dyn Fn() -> BoxFuture<'static, std::result::Result<S, BoxError>> + Send + Sync>;

type Authenticator<S> =
    Box<dyn Fn(S, MailCredentials) -> BoxFuture<'static, std::result::Result<S, BoxError>> + Send + Sync>;

/// What a queued caller is woken up with.
enum Grant<S> {
    /// A live service, already counted as in use.
    Service(S),
    /// A reserved slot; the waiter creates the service itself.
    Slot,
    /// The pool was closed.
    Closed,
}

struct Waiter<S> {
    id: u64,
    sender: oneshot::Sender<Grant<S>>,
}

struct State<S> {
    available: VecDeque<S>,
    in_use: usize,
    closed: bool,
    waiters: VecDeque<Waiter<S>>,
    next_waiter: u64,
}

impl<S> State<S> {
    /// Hands `grant` to the oldest waiter still listening. Returns it when
    /// nobody took it.
    fn offer(&mut self, mut grant: Grant<S>) -> Option<Grant<S>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }
}

struct Inner<S: MailService> {
    config: PoolConfig,
    credentials: MailCredentials,
    factory: Factory<S>,
    authenticator: Authenticator<S>,
    state: Mutex<State<S>>,
}

impl<S: MailService> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Frees one in-use slot, passing it on to the oldest waiter if any.
    fn release_slot(&self) {
        let mut state = self.lock();
        if state.closed || state.offer(Grant::Slot).is_some() {
            state.in_use -= 1;
        }
    }

    /// Takes back a service without probing it.
    fn return_service(&self, service: S) {
        let mut state = self.lock();
        if state.closed {
            state.in_use -= 1;
            drop(state);
            dispose(service);
            return;
        }
        if let Some(Grant::Service(service)) = state.offer(Grant::Service(service)) {
            state.in_use -= 1;
            state.available.push_back(service);
        }
    }

    /// Takes back a service that was lent out.
    async fn checkin(&self, mut service: S) {
        let alive = !self.is_closed() && service.is_alive().await;

        let dead = {
            let mut state = self.lock();
            if state.closed {
                state.in_use -= 1;
                Some(service)
            } else if alive {
                if let Some(Grant::Service(service)) = state.offer(Grant::Service(service)) {
                    state.in_use -= 1;
                    state.available.push_back(service);
                }
                None
            } else {
                if state.offer(Grant::Slot).is_some() {
                    state.in_use -= 1;
                }
                Some(service)
            }
        };

        if let Some(mut service) = dead {
            tracing::debug!(alive, "disconnecting returned connection");
            service.disconnect().await;
        }
    }

    async fn connect_and_authenticate(&self) -> Result<S> {
        let service = (self.factory)()
            .await
            .map_err(|e| ConnectionPoolError::classify(e, ConnectionPoolError::ConnectionFailed))?;
        (self.authenticator)(service, self.credentials.clone())
            .await
            .map_err(|e| ConnectionPoolError::classify(e, ConnectionPoolError::AuthenticationFailed))
    }

    /// Creates and authenticates a service under the retry policy.
    async fn create(&self) -> Result<S> {
        let policy = self.config.retry_policy();
        let mut attempt: u32 = 1;
        loop {
            let error = match self.connect_and_authenticate().await {
                Ok(service) => return Ok(service),
                Err(e) => e,
            };

            let Some(delay) = policy.retry_after(attempt, &error) else {
                tracing::warn!(attempt, error = %error, "giving up on new connection");
                return Err(error);
            };
            tracing::warn!(attempt, ?delay, error = %error, "connection attempt failed, retrying");
            tokio::time::sleep(delay).await;

            if self.is_closed() {
                return Err(ConnectionPoolError::PoolClosed);
            }
            attempt += 1;
        }
    }
}

/// Disconnects `service` in the background when a runtime is available.
fn dispose<S: MailService>(mut service: S) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { service.disconnect().await });
    }
}

/// A reserved in-use slot. Freed on drop unless kept.
struct Slot<'a, S: MailService> {
    inner: &'a Inner<S>,
    armed: bool,
}

impl<'a, S: MailService> Slot<'a, S> {
    const fn new(inner: &'a Inner<S>) -> Self {
        Self { inner, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<S: MailService> Drop for Slot<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_slot();
        }
    }
}

/// A queued caller. Dropping it before it is served leaves the queue.
struct Waiting<'a, S: MailService> {
    inner: &'a Inner<S>,
    id: u64,
    receiver: oneshot::Receiver<Grant<S>>,
    settled: bool,
}

impl<S: MailService> Waiting<'_, S> {
    async fn grant(&mut self) -> Grant<S> {
        let grant = (&mut self.receiver).await.unwrap_or(Grant::Closed);
        self.settled = true;
        grant
    }
}

impl<S: MailService> Drop for Waiting<'_, S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut state = self.inner.lock();
            if let Some(position) = state.waiters.iter().position(|w| w.id == self.id) {
                state.waiters.remove(position);
                return;
            }
        }
        // Already served: give back whatever raced in.
        match self.receiver.try_recv() {
            Ok(Grant::Service(service)) => self.inner.return_service(service),
            Ok(Grant::Slot) => self.inner.release_slot(),
            Ok(Grant::Closed) | Err(_) => {}
        }
    }
}

enum Checkout<S> {
    Reuse(S),
    Create,
    Wait(u64, oneshot::Receiver<Grant<S>>),
}

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Idle services ready for reuse.
    pub available: usize,
    /// Services lent out or being created.
    pub in_use: usize,
    /// Callers queued for capacity.
    pub waiters: usize,
    /// Whether [`ConnectionPool::close`] has run.
    pub closed: bool,
    /// Configured bound on `available + in_use`.
    pub max_connections: usize,
}

/// Bounded pool of authenticated mail services.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```ignore
/// use mailwire_pool::{ConnectionPool, MailCredentials, MailServerConfiguration, PoolConfig};
/// use mailwire_transport::{TransportFactory, TransportOptions};
///
/// let pool = ConnectionPool::imap(
///     MailServerConfiguration::new("imap.example.com", 993),
///     MailCredentials::new("alice", "app-password"),
///     PoolConfig::new(4),
///     TransportFactory::new(TransportOptions::default()),
/// );
///
/// let mut imap = pool.acquire().await?;
/// imap.noop().await?;
/// imap.release().await;
/// ```
pub struct ConnectionPool<S: MailService> {
    inner: Arc<Inner<S>>,
}

impl<S: MailService> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: MailService> ConnectionPool<S> {
    /// Creates a pool.
    ///
    /// `factory` opens a fresh, unauthenticated service; `authenticator`
    /// logs it in. Either may fail with a [`ConnectionPoolError`] boxed as
    /// a [`BoxError`], which is surfaced unchanged; other errors become
    /// [`ConnectionPoolError::ConnectionFailed`] or
    /// [`ConnectionPoolError::AuthenticationFailed`] respectively.
    pub fn new<F, FFut, A, AFut>(
        config: PoolConfig,
        credentials: MailCredentials,
        factory: F,
        authenticator: A,
    ) -> Self
    where
        F: Fn() -> FFut + Send + Sync + 'static,
        FFut: Future<Output = std::result::Result<S, BoxError>> + Send + 'static,
        A: Fn(S, MailCredentials) -> AFut + Send + Sync + 'static,
        AFut: Future<Output = std::result::Result<S, BoxError>> + Send + 'static,
    {
        tracing::info!(max_connections = config.max_connections(), "creating connection pool");
        let factory: Factory<S> = Box::new(move || -> BoxFuture<'static, _> { Box::pin(factory()) });
        let authenticator: Authenticator<S> = Box::new(
            move |service: S, credentials: MailCredentials| -> BoxFuture<'static, _> {
                Box::pin(authenticator(service, credentials))
            },
        );
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                factory,
                authenticator,
                state: Mutex::new(State {
                    available: VecDeque::new(),
                    in_use: 0,
                    closed: false,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    /// Borrows a service, waiting for capacity if the pool is full.
    ///
    /// There is no built-in timeout; wrap the call in
    /// [`tokio::time::timeout`] if one is needed. Dropping the future while
    /// it waits removes the caller from the queue.
    ///
    /// # Errors
    ///
    /// [`ConnectionPoolError::PoolClosed`] once the pool is closed, or the
    /// creation error if a new service could not be established.
    pub async fn acquire(&self) -> Result<PooledConnection<S>> {
        self.checkout(true).await
    }

    /// Borrows a service without waiting.
    ///
    /// # Errors
    ///
    /// [`ConnectionPoolError::PoolExhausted`] when the pool is full, plus
    /// everything [`acquire`](Self::acquire) can return.
    pub async fn try_acquire(&self) -> Result<PooledConnection<S>> {
        self.checkout(false).await
    }

    async fn checkout(&self, wait: bool) -> Result<PooledConnection<S>> {
        let inner: &Inner<S> = &self.inner;
        let max = inner.config.max_connections();
        let mut slot: Option<Slot<'_, S>> = None;

        loop {
            let next = {
                let mut state = inner.lock();
                if state.closed {
                    drop(state);
                    return Err(ConnectionPoolError::PoolClosed);
                }
                if let Some(service) = state.available.pop_front() {
                    if slot.is_none() {
                        state.in_use += 1;
                    }
                    Checkout::Reuse(service)
                } else if slot.is_some() {
                    Checkout::Create
                } else if state.in_use < max {
                    state.in_use += 1;
                    Checkout::Create
                } else if wait {
                    let (sender, receiver) = oneshot::channel();
                    let id = state.next_waiter;
                    state.next_waiter += 1;
                    state.waiters.push_back(Waiter { id, sender });
                    tracing::debug!(waiters = state.waiters.len(), "pool full, queueing");
                    Checkout::Wait(id, receiver)
                } else {
                    return Err(ConnectionPoolError::PoolExhausted);
                }
            };

            match next {
                Checkout::Reuse(mut service) => {
                    let held = slot.take().unwrap_or_else(|| Slot::new(inner));
                    if service.is_alive().await {
                        return Ok(self.lend(held, service));
                    }
                    tracing::debug!("discarding dead pooled connection");
                    service.disconnect().await;
                    slot = Some(held);
                }
                Checkout::Create => {
                    let held = slot.take().unwrap_or_else(|| Slot::new(inner));
                    return self.create(held).await;
                }
                Checkout::Wait(id, receiver) => {
                    let mut waiting = Waiting {
                        inner,
                        id,
                        receiver,
                        settled: false,
                    };
                    return match waiting.grant().await {
                        Grant::Service(service) => Ok(self.lend(Slot::new(inner), service)),
                        Grant::Slot => self.create(Slot::new(inner)).await,
                        Grant::Closed => Err(ConnectionPoolError::PoolClosed),
                    };
                }
            }
        }
    }

    async fn create(&self, slot: Slot<'_, S>) -> Result<PooledConnection<S>> {
        let mut service = self.inner.create().await?;
        if self.inner.is_closed() {
            drop(slot);
            service.disconnect().await;
            return Err(ConnectionPoolError::PoolClosed);
        }
        tracing::debug!("created pooled connection");
        Ok(self.lend(slot, service))
    }

    fn lend(&self, slot: Slot<'_, S>, service: S) -> PooledConnection<S> {
        slot.keep();
        PooledConnection {
            service: Some(service),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Returns a borrowed service. Same as [`PooledConnection::release`].
    pub async fn release(&self, connection: PooledConnection<S>) {
        connection.release().await;
    }

    /// Closes the pool.
    ///
    /// Queued callers fail with [`ConnectionPoolError::PoolClosed`] and idle
    /// services are disconnected. Services currently lent out are
    /// disconnected as they come back.
    pub async fn close(&self) {
        let (waiters, available) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.available),
            )
        };

        tracing::info!(
            waiters = waiters.len(),
            idle = available.len(),
            "closing connection pool"
        );
        for waiter in waiters {
            let _ = waiter.sender.send(Grant::Closed);
        }
        for mut service in available {
            service.disconnect().await;
        }
    }

    /// Runs `operation` on a borrowed service and returns it afterwards,
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Acquisition errors converted into `E`, or the error of `operation`.
    pub async fn with_connection<T, E, F>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut S) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: From<ConnectionPoolError>,
    {
        let mut connection = self.acquire().await?;
        let result = operation(&mut connection).await;
        connection.release().await;
        result
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            available: state.available.len(),
            in_use: state.in_use,
            waiters: state.waiters.len(),
            closed: state.closed,
            max_connections: self.inner.config.max_connections(),
        }
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<S: MailService> std::fmt::Debug for ConnectionPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// A service borrowed from a [`ConnectionPool`].
///
/// Dereferences to the service. Dropping it returns the service to the pool
/// in the background; [`release`](Self::release) does the same but waits
/// for the liveness check to finish.
pub struct PooledConnection<S: MailService> {
    service: Option<S>,
    pool: Weak<Inner<S>>,
}

impl<S: MailService> PooledConnection<S> {
    /// Returns the service to its pool.
    pub async fn release(mut self) {
        let Some(mut service) = self.service.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(inner) => inner.checkin(service).await,
            None => service.disconnect().await,
        }
    }

    /// Disconnects the service and frees its slot instead of returning it.
    pub async fn discard(mut self) {
        let Some(mut service) = self.service.take() else {
            return;
        };
        service.disconnect().await;
        if let Some(inner) = self.pool.upgrade() {
            inner.release_slot();
        }
    }
}

#[allow(clippy::expect_used)]
impl<S: MailService> Deref for PooledConnection<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.service.as_ref().expect("pooled connection already returned")
    }
}

#[allow(clippy::expect_used)]
impl<S: MailService> DerefMut for PooledConnection<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.service.as_mut().expect("pooled connection already returned")
    }
}

impl<S: MailService> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else {
            return;
        };
        let Some(inner) = self.pool.upgrade() else {
            dispose(service);
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.checkin(service).await });
            }
            Err(_) => inner.return_service(service),
        }
    }
}

impl<S: MailService + std::fmt::Debug> std::fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::retry::{ExponentialBackoff, NoRetry};

    #[derive(Debug, Clone, Default)]
    struct Harness {
        created: Arc<AtomicUsize>,
        disconnected: Arc<Mutex<Vec<usize>>>,
        dead: Arc<Mutex<HashSet<usize>>>,
    }

    impl Harness {
        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn disconnected(&self) -> Vec<usize> {
            self.disconnected.lock().unwrap().clone()
        }

        fn kill(&self, id: usize) {
            self.dead.lock().unwrap().insert(id);
        }

        fn pool(&self, max: usize) -> ConnectionPool<FakeService> {
            let harness = self.clone();
            ConnectionPool::new(
                PoolConfig::new(max).with_retry_policy(NoRetry),
                MailCredentials::new("alice", "secret"),
                move || {
                    let harness = harness.clone();
                    async move {
                        let id = harness.created.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok::<_, BoxError>(FakeService { id, harness })
                    }
                },
                |service, _credentials| async move { Ok(service) },
            )
        }
    }

    #[derive(Debug)]
    struct FakeService {
        id: usize,
        harness: Harness,
    }

    impl MailService for FakeService {
        async fn is_alive(&mut self) -> bool {
            !self.harness.dead.lock().unwrap().contains(&self.id)
        }

        async fn disconnect(&mut self) {
            self.harness.disconnected.lock().unwrap().push(self.id);
        }
    }

    async fn settle<S: MailService>(pool: &ConnectionPool<S>, check: impl Fn(PoolStats) -> bool) {
        for _ in 0..1000 {
            if check(pool.stats()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pool never settled: {:?}", pool.stats());
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let harness = Harness::default();
        let pool = harness.pool(2);

        let first = pool.acquire().await.unwrap();
        assert_eq!(first.id, 1);
        first.release().await;
        assert_eq!(pool.stats().available, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(harness.created(), 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_bound_is_respected_and_waiter_gets_released_service() {
        let harness = Harness::default();
        let pool = harness.pool(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.unwrap().id }
        });
        settle(&pool, |s| s.waiters == 1).await;
        assert_eq!(harness.created(), 2);

        a.release().await;
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(harness.created(), 2);

        let stats = pool.stats();
        assert!(stats.available + stats.in_use <= 2);
        drop(b);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let harness = Harness::default();
        let pool = harness.pool(1);
        let held = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        for name in ["first", "second"] {
            let task_pool = pool.clone();
            let order_tx = order_tx.clone();
            let expected = tasks.len() + 1;
            tasks.push(tokio::spawn(async move {
                let connection = task_pool.acquire().await.unwrap();
                order_tx.send(name).unwrap();
                connection.release().await;
            }));
            settle(&pool, |s| s.waiters == expected).await;
        }

        held.release().await;
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(order_rx.recv().await.unwrap(), "first");
        assert_eq!(order_rx.recv().await.unwrap(), "second");
        assert_eq!(harness.created(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let harness = Harness::default();
        let pool = harness.pool(1);
        let held = pool.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(pool.stats().waiters, 0);

        held.release().await;
        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use), (1, 0));
    }

    #[tokio::test]
    async fn test_dead_service_without_waiter_is_disconnected() {
        let harness = Harness::default();
        let pool = harness.pool(2);

        let connection = pool.acquire().await.unwrap();
        harness.kill(connection.id);
        connection.release().await;

        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use), (0, 0));
        assert_eq!(harness.disconnected(), [1]);
    }

    #[tokio::test]
    async fn test_dead_service_with_waiter_is_replaced() {
        let harness = Harness::default();
        let pool = harness.pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.unwrap().id }
        });
        settle(&pool, |s| s.waiters == 1).await;

        harness.kill(held.id);
        held.release().await;

        assert_eq!(waiter.await.unwrap(), 2);
        assert_eq!(harness.disconnected(), [1]);
        settle(&pool, |s| s.available == 1 && s.in_use == 0).await;
    }

    #[tokio::test]
    async fn test_dead_idle_service_is_skipped() {
        let harness = Harness::default();
        let pool = harness.pool(1);

        pool.acquire().await.unwrap().release().await;
        harness.kill(1);

        let connection = pool.acquire().await.unwrap();
        assert_eq!(connection.id, 2);
        assert_eq!(harness.disconnected(), [1]);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_later_acquires() {
        let harness = Harness::default();
        let pool = harness.pool(2);

        let idle = pool.acquire().await.unwrap();
        let held = pool.acquire().await.unwrap();
        idle.release().await;
        let held_again = pool.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|c| c.id) }
        });
        settle(&pool, |s| s.waiters == 1).await;

        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(ConnectionPoolError::PoolClosed)));
        assert!(matches!(pool.acquire().await, Err(ConnectionPoolError::PoolClosed)));
        assert_eq!(harness.created(), 2);

        held.release().await;
        held_again.release().await;
        let mut disconnected = harness.disconnected();
        disconnected.sort_unstable();
        assert_eq!(disconnected, [1, 2]);
        assert_eq!(pool.stats().in_use, 0);
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_creation_failure_frees_slot() {
        let pool: ConnectionPool<FakeService> = ConnectionPool::new(
            PoolConfig::new(1).with_retry_policy(NoRetry),
            MailCredentials::new("alice", "secret"),
            || async { Err::<FakeService, BoxError>("connection refused".into()) },
            |service, _| async move { Ok(service) },
        );

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionPoolError::ConnectionFailed(_)));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_authentication_failure_is_not_retried() {
        let harness = Harness::default();
        let factory_harness = harness.clone();
        let pool = ConnectionPool::new(
            PoolConfig::new(1).with_retry_policy(ExponentialBackoff::default()),
            MailCredentials::new("alice", "wrong"),
            move || {
                let harness = factory_harness.clone();
                async move {
                    let id = harness.created.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, BoxError>(FakeService { id, harness })
                }
            },
            |_service: FakeService, credentials: MailCredentials| async move {
                Err::<FakeService, BoxError>(format!("LOGIN rejected for {}", credentials.username).into())
            },
        );

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionPoolError::AuthenticationFailed(_)));
        assert_eq!(harness.created(), 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let harness = Harness::default();
        let pool = ConnectionPool::new(
            PoolConfig::new(1),
            MailCredentials::new("alice", "secret"),
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let harness = harness.clone();
                async move {
                    if attempt < 3 {
                        return Err::<FakeService, BoxError>("timed out".into());
                    }
                    Ok(FakeService { id: attempt, harness })
                }
            },
            |service, _| async move { Ok(service) },
        );

        let connection = pool.acquire().await.unwrap();
        assert_eq!(connection.id, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pool_errors_pass_through_factory() {
        let pool: ConnectionPool<FakeService> = ConnectionPool::new(
            PoolConfig::new(1).with_retry_policy(NoRetry),
            MailCredentials::new("alice", "secret"),
            || async { Err::<FakeService, BoxError>(Box::new(ConnectionPoolError::InvalidConnection)) },
            |service, _| async move { Ok(service) },
        );
        assert!(matches!(
            pool.acquire().await,
            Err(ConnectionPoolError::InvalidConnection)
        ));
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_error() {
        let harness = Harness::default();
        let pool = harness.pool(1);

        let id = pool
            .with_connection(|probe| Box::pin(async move { Ok::<_, ConnectionPoolError>(probe.id) }))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let err = pool
            .with_connection(|_probe| {
                Box::pin(async move { Err::<(), _>(ConnectionPoolError::InvalidConnection) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionPoolError::InvalidConnection));

        let stats = pool.stats();
        assert_eq!((stats.available, stats.in_use), (1, 0));
    }

    #[tokio::test]
    async fn test_dropped_connection_returns_to_pool() {
        let harness = Harness::default();
        let pool = harness.pool(1);

        drop(pool.acquire().await.unwrap());
        settle(&pool, |s| s.available == 1 && s.in_use == 0).await;
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let harness = Harness::default();
        let pool = harness.pool(1);

        pool.acquire().await.unwrap().discard().await;
        assert_eq!(harness.disconnected(), [1]);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.acquire().await.unwrap().id, 2);
    }

    #[test]
    fn test_try_acquire_does_not_wait() {
        let harness = Harness::default();
        let pool = harness.pool(1);

        tokio_test::block_on(async {
            let held = pool.try_acquire().await.unwrap();
            assert!(matches!(
                pool.try_acquire().await,
                Err(ConnectionPoolError::PoolExhausted)
            ));
            held.release().await;
            assert!(pool.try_acquire().await.is_ok());
        });
    }
}
