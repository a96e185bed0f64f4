//! Bounded pool of physical connections

use crate::config::PoolConfiguration;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::eviction::{ConnectionMetadata, EvictionPolicy};

use async_trait::async_trait;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Driver contract for opening and probing connections
///
/// Closing a connection is dropping it.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new physical connection
    async fn connect(&self, config: &PoolConfiguration) -> Result<Self::Connection, BoxError>;

    /// Issue a trivial round trip on an open connection
    async fn ping(&self, connection: &mut Self::Connection) -> Result<(), BoxError>;
}

/// Lifecycle hooks fired by a [`ResourcePool`]
pub trait PoolEventListener: Send + Sync {
    /// A physical connection was opened
    fn on_created(&self, _connection_id: u64, _live_connections: usize) {}

    /// A physical connection was closed
    fn on_removed(&self, _connection_id: u64, _lifetime: Duration) {}

    /// Opening a connection failed
    fn on_error(&self, _error: &PoolError) {}
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl PoolEventListener for NoopListener {}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
    pub waiting: usize,
    pub max: usize,
}

/// A checked-out connection that returns to its pool when dropped
pub struct PooledConnection<F: ConnectionFactory> {
    connection: Option<F::Connection>,
    metadata: ConnectionMetadata,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    /// Number of times this physical connection has been checked out
    pub fn uses(&self) -> u64 {
        self.metadata.uses
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Take the raw connection out of the pool's accounting
    pub fn detach(mut self) -> F::Connection {
        let connection = self.connection.take().expect("Connection already taken");
        self.pool.forget(&self.metadata);
        connection
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.active.remove(&self.metadata.id);
            self.pool.destroy(connection, &self.metadata);
            self.pool.notify_if_closed();
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("Connection already taken")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("Connection already taken")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection, self.metadata.clone());
        }
        // The slot is freed only after the connection is back in the idle queue
        drop(self.permit.take());
    }
}

struct PoolInner<F: ConnectionFactory> {
    config: Arc<PoolConfiguration>,
    factory: Arc<F>,
    eviction: EvictionPolicy,
    idle: ArrayQueue<(F::Connection, ConnectionMetadata)>,
    active: DashMap<u64, ()>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    live: AtomicUsize,
    waiting: AtomicUsize,
    closed: AtomicBool,
    released: Notify,
    listener: Arc<dyn PoolEventListener>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn checkout(
        self: &Arc<Self>,
        connection: F::Connection,
        mut metadata: ConnectionMetadata,
        permit: OwnedSemaphorePermit,
    ) -> PoolResult<PooledConnection<F>> {
        self.active.insert(metadata.id, ());
        if self.closed.load(Ordering::SeqCst) {
            self.active.remove(&metadata.id);
            self.destroy(connection, &metadata);
            self.released.notify_waiters();
            return Err(PoolError::PoolClosed);
        }

        metadata.checked_out();
        tracing::trace!(connection_id = metadata.id, uses = metadata.uses, "connection checked out");

        Ok(PooledConnection {
            connection: Some(connection),
            metadata,
            permit: Some(permit),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, connection: F::Connection, mut metadata: ConnectionMetadata) {
        self.active.remove(&metadata.id);
        metadata.touch();

        let over_capacity = self.live.load(Ordering::SeqCst) > self.config.max_connections;
        if self.closed.load(Ordering::SeqCst) || over_capacity || metadata.needs_rotation(&self.eviction) {
            self.destroy(connection, &metadata);
        } else if let Err((connection, metadata)) = self.idle.push((connection, metadata)) {
            self.destroy(connection, &metadata);
        } else {
            tracing::trace!("connection returned to pool");
            // close() may have drained the idle queue between our checks
            if self.closed.load(Ordering::SeqCst) {
                self.drain_idle();
            }
        }

        self.notify_if_closed();
    }

    fn forget(&self, metadata: &ConnectionMetadata) {
        self.active.remove(&metadata.id);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.listener.on_removed(metadata.id, metadata.age());
        self.notify_if_closed();
    }

    fn destroy(&self, connection: F::Connection, metadata: &ConnectionMetadata) {
        drop(connection);
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(
            connection_id = metadata.id,
            uses = metadata.uses,
            age_ms = metadata.age().as_millis() as u64,
            "connection closed"
        );
        self.listener.on_removed(metadata.id, metadata.age());
    }

    fn drain_idle(&self) -> usize {
        let mut drained = 0;
        while let Some((connection, metadata)) = self.idle.pop() {
            self.destroy(connection, &metadata);
            drained += 1;
        }
        drained
    }

    fn notify_if_closed(&self) {
        if self.closed.load(Ordering::SeqCst) {
            self.released.notify_waiters();
        }
    }

    async fn open(&self, deadline: tokio::time::Instant) -> PoolResult<(F::Connection, ConnectionMetadata)> {
        let opened = tokio::time::timeout_at(deadline, self.factory.connect(&self.config)).await;
        let connection = match opened {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                let error = PoolError::ConnectFailed(e.to_string());
                self.listener.on_error(&error);
                return Err(error);
            }
            Err(_) => {
                let error = PoolError::Timeout(self.config.connect_timeout);
                self.listener.on_error(&error);
                return Err(error);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(connection_id = id, live, "opened new connection");
        self.listener.on_created(id, live);
        Ok((connection, ConnectionMetadata::new(id)))
    }
}

/// Decrements the waiter count even when the checkout future is dropped
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Bounded set of live connections with FIFO checkout
///
/// At most `max_connections` connections are checked out at once. Waiters
/// are served in arrival order and give up after `connect_timeout`.
pub struct ResourcePool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ResourcePool<F> {
    /// Create an empty pool
    pub fn new(
        config: PoolConfiguration,
        factory: Arc<F>,
        listener: Arc<dyn PoolEventListener>,
    ) -> PoolResult<Self> {
        config.validate()?;

        let max = config.max_connections;
        let eviction = EvictionPolicy::from_config(&config);

        Ok(Self {
            inner: Arc::new(PoolInner {
                config: Arc::new(config),
                factory,
                eviction,
                idle: ArrayQueue::new(max),
                active: DashMap::new(),
                slots: Arc::new(Semaphore::new(max)),
                next_id: AtomicU64::new(1),
                live: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                listener,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    pub fn max_connections(&self) -> usize {
        self.inner.config.max_connections
    }

    /// Check out a connection, opening one if no idle connection is usable
    pub async fn acquire(&self) -> PoolResult<PooledConnection<F>> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let timeout = self.inner.config.connect_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let permit = {
            let _waiting = WaitGuard::enter(&self.inner.waiting);
            let slot = Arc::clone(&self.inner.slots).acquire_owned();
            match tokio::time::timeout_at(deadline, slot).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::PoolClosed),
                Err(_) => return Err(PoolError::Timeout(timeout)),
            }
        };

        while let Some((connection, metadata)) = self.inner.idle.pop() {
            if metadata.needs_rotation(&self.inner.eviction) {
                self.inner.destroy(connection, &metadata);
                continue;
            }
            return self.inner.checkout(connection, metadata, permit);
        }

        let (connection, metadata) = self.inner.open(deadline).await?;
        self.inner.checkout(connection, metadata, permit)
    }

    /// Check out a connection and run the driver's ping on it
    ///
    /// A connection that fails the ping is closed rather than returned.
    pub async fn ping(&self) -> PoolResult<Duration> {
        let started = Instant::now();
        let mut connection = self
            .acquire()
            .await
            .map_err(|e| PoolError::HealthCheckFailed(e.to_string()))?;

        match self.inner.factory.ping(&mut *connection).await {
            Ok(()) => Ok(started.elapsed()),
            Err(e) => {
                connection.discard();
                Err(PoolError::HealthCheckFailed(e.to_string()))
            }
        }
    }

    /// Open idle connections until `target` connections are live
    pub async fn warmup(&self, target: usize) -> PoolResult<usize> {
        let target = target.min(self.inner.config.max_connections);
        let mut created = 0;

        while !self.is_closed() && self.inner.live.load(Ordering::SeqCst) < target {
            let deadline = tokio::time::Instant::now() + self.inner.config.connect_timeout;
            let (connection, metadata) = self.inner.open(deadline).await?;
            if let Err((connection, metadata)) = self.inner.idle.push((connection, metadata)) {
                self.inner.destroy(connection, &metadata);
                break;
            }
            created += 1;
        }

        if created > 0 {
            tracing::debug!(created, target, "warmed up pool");
        }
        Ok(created)
    }

    /// Close idle connections that are expired, keeping `min_connections` open
    pub fn reap_idle(&self) -> usize {
        let mut candidates = Vec::with_capacity(self.inner.idle.len());
        while let Some(entry) = self.inner.idle.pop() {
            candidates.push(entry);
        }

        let min = self.inner.config.min_connections;
        let mut reaped = 0;
        for (connection, metadata) in candidates {
            let expired = metadata.is_expired(&self.inner.eviction);
            if expired && self.inner.live.load(Ordering::SeqCst) > min {
                self.inner.destroy(connection, &metadata);
                reaped += 1;
            } else if let Err((connection, metadata)) = self.inner.idle.push((connection, metadata)) {
                self.inner.destroy(connection, &metadata);
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle connections");
        }
        reaped
    }

    /// Reject new checkouts, wait for checked-out connections to come back,
    /// then close everything
    ///
    /// Every call waits for outstanding checkouts. Only the first one closes
    /// the checkout queue and logs.
    pub async fn close(&self) {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        if first {
            self.inner.slots.close();
        }

        loop {
            let released = self.inner.released.notified();
            if self.inner.active.is_empty() {
                break;
            }
            released.await;
        }

        let drained = self.inner.drain_idle();
        if first {
            tracing::info!(
                max = self.inner.config.max_connections,
                drained,
                "resource pool closed"
            );
        }
    }

    /// Close a pool that has been replaced, without failing anyone already in it
    ///
    /// Takes every checkout slot in FIFO order, so callers queued or still
    /// opening a connection are served first, then closes. Each of those
    /// callers is still bounded by its own `connect_timeout`.
    pub async fn retire(&self) {
        let slots = u32::try_from(self.inner.config.max_connections).unwrap_or(u32::MAX);
        match Arc::clone(&self.inner.slots).acquire_many_owned(slots).await {
            Ok(all) => {
                tracing::debug!(
                    max = self.inner.config.max_connections,
                    "retired pool has no callers left"
                );
                self.close().await;
                drop(all);
            }
            // closed under us by a hard close
            Err(_) => self.close().await,
        }
    }

    /// Whether both handles point at the same pool
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.idle.len();
        let active = self.inner.active.len();
        PoolStatus {
            idle,
            active,
            total: idle + active,
            waiting: self.inner.waiting.load(Ordering::Relaxed),
            max: self.inner.config.max_connections,
        }
    }

    /// Physical connections currently open, including ones being handed out
    pub fn live_connections(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}
