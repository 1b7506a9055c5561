//! Connection pool for the backing store.
//!
//! Bounded by a semaphore of `max_size` permits. A borrowed connection holds
//! one permit inside its [`PooledConnection`] guard and goes back to the idle
//! queue when the guard drops, so release happens on every exit path.
//! Connections are opened lazily; a failed open marks the pool unhealthy
//! until a later open or [`Pool::ping`] succeeds.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backend::BackendError;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "cache::pool";

/// Creates and validates connections for a [`Pool`].
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection, BackendError>;

    async fn validate(&self, conn: &mut Self::Connection) -> Result<(), BackendError>;
}

#[async_trait]
impl<M: Manager + ?Sized> Manager for Arc<M> {
    type Connection = M::Connection;

    async fn create(&self) -> Result<Self::Connection, BackendError> {
        (**self).create().await
    }

    async fn validate(&self, conn: &mut Self::Connection) -> Result<(), BackendError> {
        (**self).validate(conn).await
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool exhausted ({max_size} connections in use)")]
    Exhausted { max_size: usize },
    #[error("timed out after {waited_ms} ms waiting for a pooled connection")]
    Timeout { waited_ms: u64 },
    #[error("connection pool is closed")]
    Closed,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub validate_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            validate_on_borrow: true,
        }
    }
}

impl From<&crate::config::StoreSettings> for PoolConfig {
    fn from(settings: &crate::config::StoreSettings) -> Self {
        Self {
            min_size: settings.min_connections,
            max_size: settings.max_connections.get(),
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(settings.idle_timeout_seconds),
            validate_on_borrow: settings.validate_on_borrow,
        }
    }
}

/// Point-in-time occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    slots: Arc<Semaphore>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    returned: Notify,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Bounded, lazily filled connection pool.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Manager> Pool<M> {
    /// Build a pool; no connection is opened until first use or [`Pool::warm_up`].
    pub fn new(manager: M, mut config: PoolConfig) -> Self {
        config.max_size = config.max_size.max(1);
        config.min_size = config.min_size.min(config.max_size);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                slots: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(VecDeque::new()),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
                healthy: AtomicBool::new(true),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to `acquire_timeout` for a free slot.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let started = Instant::now();
        let timeout = self.inner.config.acquire_timeout;
        let outcome = tokio::time::timeout(timeout, async {
            let permit = Arc::clone(&self.inner.slots)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?;
            self.checkout(permit).await
        })
        .await;

        histogram!("shelfcache_pool_acquire_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                counter!("shelfcache_pool_timeout_total").increment(1);
                warn!(
                    target = SOURCE,
                    waited_ms = timeout.as_millis() as u64,
                    in_use = self.inner.in_use.load(Ordering::SeqCst),
                    "timed out waiting for a pooled connection"
                );
                Err(PoolError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Borrow a connection only if a slot is free right now.
    pub async fn try_acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(PoolError::Exhausted {
                    max_size: self.inner.config.max_size,
                });
            }
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
        };
        self.checkout(permit).await
    }

    /// Return a borrowed connection. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Borrow a connection for the duration of `f`.
    ///
    /// A connection-level failure discards the connection instead of returning
    /// it to the idle queue.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        F: for<'c> FnOnce(&'c mut M::Connection) -> BoxFuture<'c, Result<T, BackendError>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut *conn).await;
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_connection_failure() {
                    self.mark_unhealthy(&err.to_string());
                    conn.discard();
                }
                Err(PoolError::Backend(err))
            }
        }
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection<M>, PoolError> {
        while let Some(candidate) = self.pop_idle() {
            let mut conn = candidate.conn;
            if candidate.idle_since.elapsed() >= self.inner.config.idle_timeout {
                debug!(target = SOURCE, "dropping connection past its idle timeout");
                continue;
            }
            if self.inner.config.validate_on_borrow {
                if let Err(err) = self.inner.manager.validate(&mut conn).await {
                    debug!(target = SOURCE, error = %err, "discarding connection that failed validation");
                    continue;
                }
            }
            return Ok(self.lend(conn, permit));
        }

        match self.inner.manager.create().await {
            Ok(conn) => {
                self.mark_healthy();
                Ok(self.lend(conn, permit))
            }
            Err(err) => {
                self.mark_unhealthy(&err.to_string());
                Err(PoolError::Backend(err))
            }
        }
    }

    fn pop_idle(&self) -> Option<IdleConnection<M::Connection>> {
        mutex_lock(&self.inner.idle, SOURCE, "pop_idle").pop_front()
    }

    fn lend(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        PooledConnection {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Open up to `min_size` idle connections. Failures are recorded, not returned.
    pub async fn warm_up(&self) -> usize {
        let wanted = self
            .inner
            .config
            .min_size
            .saturating_sub(self.status().size);
        let mut opened = 0;
        for _ in 0..wanted {
            match self.inner.manager.create().await {
                Ok(conn) => {
                    self.mark_healthy();
                    mutex_lock(&self.inner.idle, SOURCE, "warm_up").push_back(IdleConnection {
                        conn,
                        idle_since: Instant::now(),
                    });
                    opened += 1;
                }
                Err(err) => {
                    self.mark_unhealthy(&err.to_string());
                    break;
                }
            }
        }
        info!(target = SOURCE, opened, wanted, "connection pool warm-up finished");
        opened
    }

    /// Validate one connection and update the health flag accordingly.
    pub async fn ping(&self) -> bool {
        let mut conn = match self.acquire().await {
            Ok(conn) => conn,
            Err(PoolError::Backend(_)) => return false,
            Err(err) => {
                debug!(target = SOURCE, error = %err, "health ping could not borrow a connection");
                return self.is_healthy();
            }
        };
        match self.inner.manager.validate(&mut conn).await {
            Ok(()) => {
                self.mark_healthy();
                true
            }
            Err(err) => {
                self.mark_unhealthy(&err.to_string());
                conn.discard();
                false
            }
        }
    }

    /// Drop idle connections past `idle_timeout`, keeping at least `min_size` open.
    pub fn reap_idle(&self) -> usize {
        let in_use = self.inner.in_use.load(Ordering::SeqCst);
        let mut idle = mutex_lock(&self.inner.idle, SOURCE, "reap_idle");
        let mut surplus = (idle.len() + in_use).saturating_sub(self.inner.config.min_size);
        let timeout = self.inner.config.idle_timeout;
        let before = idle.len();
        idle.retain(|entry| {
            if surplus > 0 && entry.idle_since.elapsed() >= timeout {
                surplus -= 1;
                false
            } else {
                true
            }
        });
        before - idle.len()
    }

    /// Spawn the background probe: ping, then reap, every `every`.
    pub fn spawn_health_probe(&self, every: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                let healthy = pool.ping().await;
                let reaped = pool.reap_idle();
                debug!(target = SOURCE, healthy, reaped, "pool health probe");
            }
        })
    }

    /// Stop lending, wait up to `grace` for borrowed connections, then drop every idle one.
    ///
    /// Returns false when borrows were still outstanding at the deadline.
    pub async fn close(&self, grace: Duration) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.slots.close();

        let deadline = Instant::now() + grace;
        let drained = loop {
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_use.load(Ordering::SeqCst) == 0 {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break false;
            }
        };

        let destroyed = {
            let mut idle = mutex_lock(&self.inner.idle, SOURCE, "close");
            let count = idle.len();
            idle.clear();
            count
        };
        info!(target = SOURCE, drained, destroyed, "connection pool closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        mutex_lock(&self.inner.last_error, SOURCE, "last_error").clone()
    }

    /// Record a failure observed by a caller holding a connection.
    pub fn mark_unhealthy(&self, error: &str) {
        *mutex_lock(&self.inner.last_error, SOURCE, "mark_unhealthy") = Some(error.to_string());
        if self.inner.healthy.swap(false, Ordering::SeqCst) {
            warn!(target = SOURCE, error, "backing store marked unhealthy");
        }
    }

    fn mark_healthy(&self) {
        if !self.inner.healthy.swap(true, Ordering::SeqCst) {
            info!(target = SOURCE, "backing store healthy again");
        }
    }

    pub fn status(&self) -> PoolStatus {
        let idle = mutex_lock(&self.inner.idle, SOURCE, "status").len();
        let in_use = self.inner.in_use.load(Ordering::SeqCst);
        PoolStatus {
            size: idle + in_use,
            idle,
            in_use,
            max_size: self.inner.config.max_size,
        }
    }
}

/// Exclusive borrow of a pooled connection; returned to the pool on drop.
pub struct PooledConnection<M: Manager> {
    conn: Option<M::Connection>,
    inner: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: Manager> PooledConnection<M> {
    /// Destroy the connection instead of returning it.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<M: Manager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume the guard.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: Manager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.inner.closed.load(Ordering::SeqCst) {
                mutex_lock(&self.inner.idle, SOURCE, "release").push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            }
        }
        self.inner.in_use.fetch_sub(1, Ordering::SeqCst);
        self.inner.returned.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::FutureExt;

    use super::*;

    #[derive(Default)]
    struct CountingManager {
        created: AtomicU32,
        fail_create: AtomicBool,
        fail_validate: AtomicBool,
    }

    #[async_trait]
    impl Manager for CountingManager {
        type Connection = u32;

        async fn create(&self) -> Result<u32, BackendError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("connection refused".to_string()));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn validate(&self, _conn: &mut u32) -> Result<(), BackendError> {
            if self.fail_validate.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("stale".to_string()));
            }
            Ok(())
        }
    }

    fn pool(max_size: usize) -> (Arc<CountingManager>, Pool<Arc<CountingManager>>) {
        let manager = Arc::new(CountingManager::default());
        let pool = Pool::new(
            Arc::clone(&manager),
            PoolConfig {
                min_size: 0,
                max_size,
                acquire_timeout: Duration::from_millis(50),
                idle_timeout: Duration::from_secs(60),
                validate_on_borrow: true,
            },
        );
        (manager, pool)
    }

    #[tokio::test]
    async fn connections_are_reused_after_release() {
        let (manager, pool) = pool(2);

        let first = pool.acquire().await.expect("first borrow");
        let id = *first;
        pool.release(first);

        let second = pool.acquire().await.expect("second borrow");
        assert_eq!(*second, id);
        assert_eq!(manager.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn try_acquire_reports_exhaustion() {
        let (_, pool) = pool(1);
        let _held = pool.acquire().await.expect("borrow");

        let err = pool.try_acquire().await.err().expect("pool is full");
        assert!(matches!(err, PoolError::Exhausted { max_size: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_every_slot_is_borrowed() {
        let (_, pool) = pool(1);
        let _held = pool.acquire().await.expect("borrow");

        let err = pool.acquire().await.err().expect("no slot frees up");
        assert!(matches!(err, PoolError::Timeout { waited_ms: 50 }));
    }

    #[tokio::test]
    async fn failed_create_marks_pool_unhealthy_until_ping_succeeds() {
        let (manager, pool) = pool(2);
        manager.fail_create.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.err().expect("create fails");
        assert!(matches!(err, PoolError::Backend(_)));
        assert!(!pool.is_healthy());
        assert!(pool.last_error().is_some_and(|e| e.contains("refused")));
        assert_eq!(pool.status().in_use, 0);

        manager.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.ping().await);
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn failed_validation_replaces_idle_connection() {
        let (manager, pool) = pool(1);
        pool.release(pool.acquire().await.expect("borrow"));

        manager.fail_validate.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.expect("fresh connection");
        assert_eq!(*conn, 2);
    }

    #[tokio::test]
    async fn with_connection_discards_on_connection_failure() {
        let (manager, pool) = pool(1);

        let err = pool
            .with_connection(|_conn| {
                async { Err::<(), _>(BackendError::Unavailable("reset".to_string())) }.boxed()
            })
            .await
            .err()
            .expect("closure fails");
        assert!(matches!(err, PoolError::Backend(BackendError::Unavailable(_))));
        assert_eq!(pool.status().idle, 0);
        assert!(!pool.is_healthy());

        let value = pool
            .with_connection(|conn| {
                let id = *conn;
                async move { Ok(id * 10) }.boxed()
            })
            .await
            .expect("closure succeeds");
        assert_eq!(value, 20);
        assert_eq!(manager.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn warm_up_opens_min_size_connections() {
        let manager = Arc::new(CountingManager::default());
        let pool = Pool::new(
            Arc::clone(&manager),
            PoolConfig {
                min_size: 3,
                max_size: 5,
                ..PoolConfig::default()
            },
        );
        assert_eq!(pool.status().size, 0);
        assert_eq!(pool.warm_up().await, 3);
        assert_eq!(pool.status().idle, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reap_idle_keeps_min_size() {
        let manager = Arc::new(CountingManager::default());
        let pool = Pool::new(
            Arc::clone(&manager),
            PoolConfig {
                min_size: 1,
                max_size: 4,
                idle_timeout: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        );
        let a = pool.acquire().await.expect("a");
        let b = pool.acquire().await.expect("b");
        let c = pool.acquire().await.expect("c");
        drop((a, b, c));
        assert_eq!(pool.status().idle, 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_borrowed_connections() {
        let (_, pool) = pool(2);
        let held = pool.acquire().await.expect("borrow");

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        drop(held);
        assert!(closer.await.expect("close task"));
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_after_grace() {
        let (_, pool) = pool(1);
        let _held = pool.acquire().await.expect("borrow");
        assert!(!pool.close(Duration::from_millis(200)).await);
    }
}
