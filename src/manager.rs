//! Pool manager: adaptive sizing, priority reservation and background upkeep
//! in front of a hot-swappable [`ResourcePool`]

use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::health::{HealthStatus, HealthTracker, LEAK_SUSPICION_RATIO, WAITING_WARN_THRESHOLD};
use crate::memory::{MemoryProbe, ProcessMemoryProbe};
use crate::metrics::{ConnectionMetrics, MetricsExporter};
use crate::priority::ConnectionPriority;
use crate::reservation::PriorityReservationPolicy;
use crate::resource::{ConnectionFactory, PoolEventListener, PooledConnection, ResourcePool};
use crate::scheduler::ScheduledTask;
use crate::sizing::{AdaptiveSizingPolicy, SizingDecision};
use crate::snapshots::{DEFAULT_HISTORY, LifecycleCounters, MemorySnapshot, SnapshotStore};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Idle connections above which maintenance may shrink a pressured pool
pub const IDLE_SHRINK_THRESHOLD: usize = 3;

/// Outcome of one maintenance run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    /// New maximum when the pool was shrunk
    pub resized_to: Option<usize>,
    /// Idle connections closed for exceeding their timeout or lifetime
    pub reaped: usize,
    /// Connections opened to get back to `min_connections`
    pub warmed: usize,
    /// Snapshot entries dropped from the history
    pub trimmed: usize,
    pub warnings: Vec<String>,
}

/// Feeds pool lifecycle events into the shared counters and history
struct MetricsListener {
    snapshots: Arc<SnapshotStore>,
    counters: Arc<LifecycleCounters>,
    memory: Arc<dyn MemoryProbe>,
}

impl PoolEventListener for MetricsListener {
    fn on_created(&self, _connection_id: u64, live_connections: usize) {
        self.counters.record_created();
        self.snapshots.record(self.memory.current_mb(), live_connections);
    }

    fn on_removed(&self, _connection_id: u64, lifetime: Duration) {
        self.counters.record_destroyed(lifetime);
    }

    fn on_error(&self, error: &PoolError) {
        tracing::warn!(error = %error, "connection pool error");
    }
}

struct RetiringPool<F: ConnectionFactory> {
    pool: ResourcePool<F>,
    drain: Option<JoinHandle<()>>,
}

struct ManagerInner<F: ConnectionFactory> {
    factory: Arc<F>,
    active: RwLock<ResourcePool<F>>,
    swap_lock: Mutex<()>,
    reservation: PriorityReservationPolicy,
    snapshots: Arc<SnapshotStore>,
    counters: Arc<LifecycleCounters>,
    memory: Arc<dyn MemoryProbe>,
    listener: Arc<dyn PoolEventListener>,
    health: HealthTracker,
    retiring: Mutex<Vec<RetiringPool<F>>>,
    tasks: Mutex<Vec<ScheduledTask>>,
    shut_down: AtomicBool,
}

impl<F: ConnectionFactory> ManagerInner<F> {
    fn active_pool(&self) -> ResourcePool<F> {
        self.active.read().clone()
    }

    /// Projection of the active pool only
    ///
    /// Connections still checked out from a retiring pool, and callers queued
    /// on one, are not counted until that pool has drained.
    fn metrics(&self) -> ConnectionMetrics {
        let status = self.active_pool().status();
        ConnectionMetrics::project(
            status,
            self.snapshots.most_recent().as_ref(),
            &self.counters,
            self.reservation.reserved(status.total),
        )
    }

    /// Sizing bounds of the active configuration
    fn sizing(&self) -> AdaptiveSizingPolicy {
        AdaptiveSizingPolicy::from_config(self.active_pool().config())
    }

    fn evaluate_sizing(&self) -> Option<usize> {
        let memory_mb = self.memory.current_mb();
        let pool = self.active_pool();
        let current = pool.max_connections();
        let sizing = AdaptiveSizingPolicy::from_config(pool.config());

        match sizing.decide(memory_mb, current) {
            SizingDecision::Unchanged => None,
            SizingDecision::Resize(target) => {
                tracing::info!(
                    memory_mb,
                    threshold_mb = sizing.threshold_mb(),
                    from = current,
                    to = target,
                    "memory usage changed pool size"
                );
                self.resize(target).ok()
            }
        }
    }

    fn resize(&self, target: usize) -> PoolResult<usize> {
        let _swap = self.swap_lock.lock();
        let current = self.active_pool().config().clone();
        if current.max_connections == target {
            return Ok(target);
        }
        self.swap_locked(current.with_max_connections(target))
    }

    fn apply_configuration(&self, next: PoolConfiguration) -> PoolResult<usize> {
        let _swap = self.swap_lock.lock();
        self.swap_locked(next)
    }

    /// Build a pool for `next`, make it active, and schedule the old one to drain.
    /// Caller holds `swap_lock`.
    fn swap_locked(&self, next: PoolConfiguration) -> PoolResult<usize> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ConfigurationSwapFailed("manager is shut down".to_string()));
        }

        let max = next.max_connections;
        let pool = match ResourcePool::new(next.clone(), Arc::clone(&self.factory), Arc::clone(&self.listener)) {
            Ok(pool) => pool,
            Err(e) => {
                let error = PoolError::ConfigurationSwapFailed(e.to_string());
                tracing::warn!(
                    error = %error,
                    attempted = ?next,
                    "keeping previous pool after failed configuration swap"
                );
                return Err(error);
            }
        };

        let previous = std::mem::replace(&mut *self.active.write(), pool);
        tracing::info!(
            from = previous.max_connections(),
            to = max,
            "swapped active connection pool"
        );
        self.retire(previous);
        Ok(max)
    }

    fn retire(&self, previous: ResourcePool<F>) {
        let grace = previous.config().swap_grace_period;
        let finished = self.take_finished_drains();
        let drain = match Handle::try_current() {
            Ok(handle) => {
                if !finished.is_empty() {
                    handle.spawn(join_drains(finished));
                }
                let pool = previous.clone();
                Some(handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    pool.retire().await;
                    tracing::debug!(max = pool.max_connections(), "retired pool drained");
                }))
            }
            Err(_) => {
                tracing::warn!("no runtime to drain retired pool, it will close on shutdown");
                None
            }
        };

        self.retiring.lock().push(RetiringPool { pool: previous, drain });
    }

    /// Remove retired pools whose drain task has ended, returning the handles
    fn take_finished_drains(&self) -> Vec<JoinHandle<()>> {
        let mut retiring = self.retiring.lock();
        let mut finished = Vec::new();
        let mut kept = Vec::with_capacity(retiring.len());
        for entry in retiring.drain(..) {
            match entry.drain {
                Some(handle) if handle.is_finished() => finished.push(handle),
                _ => kept.push(entry),
            }
        }
        *retiring = kept;
        finished
    }

    /// Check out from `pool`, falling over to the active pool when `pool`
    /// was retired and closed before this caller reached it
    async fn acquire_from(&self, pool: ResourcePool<F>) -> PoolResult<PooledConnection<F>> {
        match pool.acquire().await {
            Err(PoolError::PoolClosed) if !self.shut_down.load(Ordering::SeqCst) => {
                let active = self.active_pool();
                if active.same_pool(&pool) {
                    return Err(PoolError::PoolClosed);
                }
                tracing::debug!(
                    from = pool.max_connections(),
                    to = active.max_connections(),
                    "pool retired before checkout, using active pool"
                );
                active.acquire().await
            }
            other => other,
        }
    }

    async fn health_check(&self) -> PoolResult<Duration> {
        let pool = self.active_pool();
        match pool.ping().await {
            Ok(latency) => {
                self.health.record_success(latency);
                tracing::debug!(latency_us = latency.as_micros() as u64, "health check passed");
                Ok(latency)
            }
            Err(e) => {
                self.health.record_failure();
                let metrics = self.metrics();
                tracing::warn!(
                    error = %e,
                    consecutive_failures = self.health.consecutive_failures(),
                    total = metrics.total_connections,
                    active = metrics.active_connections,
                    idle = metrics.idle_connections,
                    waiting = metrics.waiting_clients,
                    "health check failed"
                );
                Err(e)
            }
        }
    }

    async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.shut_down.load(Ordering::SeqCst) {
            return report;
        }

        let config = self.active_pool().config().clone();
        let sizing = self.sizing();
        let memory_mb = self.memory.current_mb();

        let idle = self.active_pool().idle_count();
        if config.memory_based_scaling
            && sizing.is_under_pressure(memory_mb)
            && idle > IDLE_SHRINK_THRESHOLD
            && config.max_connections > sizing.low_memory_max()
        {
            tracing::info!(memory_mb, idle, "shrinking pool under memory pressure");
            report.resized_to = self.resize(sizing.low_memory_max()).ok();
        }

        let pool = self.active_pool();
        report.reaped = pool.reap_idle();
        match pool.warmup(pool.config().min_connections).await {
            Ok(warmed) => report.warmed = warmed,
            Err(e) => tracing::warn!(error = %e, "failed to top up idle connections"),
        }

        report.trimmed = self.snapshots.trim(DEFAULT_HISTORY);
        if report.trimmed > 0 {
            tracing::debug!(trimmed = report.trimmed, "trimmed memory snapshot history");
        }

        let metrics = self.metrics();
        let health = HealthStatus::evaluate(&metrics, self.health.consecutive_failures());
        if metrics.waiting_clients > WAITING_WARN_THRESHOLD {
            tracing::warn!(
                waiting = metrics.waiting_clients,
                total = metrics.total_connections,
                max = metrics.max_connections,
                "clients are queueing for connections"
            );
        }
        if health.leak_suspected {
            tracing::warn!(
                active = metrics.active_connections,
                total = metrics.total_connections,
                ratio = LEAK_SUSPICION_RATIO,
                "almost every connection is checked out, possible connection leak"
            );
        }
        report.warnings = health.warnings;

        join_drains(self.take_finished_drains()).await;

        report
    }
}

/// Await drain tasks, logging any that panicked. Returns how many did.
async fn join_drains(handles: Vec<JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for handle in handles {
        if let Err(e) = handle.await
            && e.is_panic()
        {
            tracing::warn!(error = %e, "retired pool drain task panicked");
            panicked += 1;
        }
    }
    panicked
}

/// Memory-aware, priority-sensitive connection pool manager
///
/// Construct once per process with [`PoolManager::builder`], share it by
/// cloning, and call [`PoolManager::shutdown`] before exit.
pub struct PoolManager<F: ConnectionFactory> {
    inner: Arc<ManagerInner<F>>,
}

impl<F: ConnectionFactory> Clone for PoolManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> PoolManager<F> {
    pub fn builder(factory: F) -> PoolManagerBuilder<F> {
        PoolManagerBuilder::new(factory)
    }

    /// Build a manager from `DATABASE_URL` and the `DB_*` variables
    pub fn from_env(factory: F) -> PoolResult<Self> {
        Self::builder(factory).config(PoolConfiguration::from_env()?).build()
    }

    /// Check out a connection on behalf of a caller with the given priority
    ///
    /// Sizing is re-evaluated first (which may swap in a resized pool), then
    /// critical callers may mark capacity as reserved. Waiting is FIFO and
    /// bounded by `connect_timeout`. Failures are returned, never retried.
    pub async fn connect(&self, priority: ConnectionPriority) -> PoolResult<PooledConnection<F>> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::SeqCst) {
            return Err(self.acquisition_failed(PoolError::PoolClosed, &priority));
        }

        let scaling = inner.active_pool().config().memory_based_scaling;
        if scaling {
            inner.evaluate_sizing();
        }

        let pool = inner.active_pool();
        if pool.config().priority_connection_reservation && priority.level.is_elevated() {
            let status = pool.status();
            inner.reservation.evaluate(&priority, status.total, status.active);
        }

        let started = Instant::now();
        match inner.acquire_from(pool).await {
            Ok(connection) => {
                let waited = started.elapsed();
                inner.counters.record_acquisition(waited);
                tracing::trace!(
                    connection_id = connection.id(),
                    priority = %priority.level,
                    operation = %priority.operation_type,
                    wait_us = waited.as_micros() as u64,
                    "connection acquired"
                );
                Ok(connection)
            }
            Err(reason) => Err(self.acquisition_failed(reason, &priority)),
        }
    }

    /// [`connect`](Self::connect) with the default normal priority
    pub async fn connect_default(&self) -> PoolResult<PooledConnection<F>> {
        self.connect(ConnectionPriority::default()).await
    }

    fn acquisition_failed(&self, reason: PoolError, priority: &ConnectionPriority) -> PoolError {
        self.inner.counters.record_acquisition_failure();
        let metrics = self.inner.metrics();
        tracing::error!(
            error = %reason,
            priority = %priority.level,
            operation = %priority.operation_type,
            total = metrics.total_connections,
            active = metrics.active_connections,
            idle = metrics.idle_connections,
            waiting = metrics.waiting_clients,
            max = metrics.max_connections,
            "failed to acquire connection"
        );
        PoolError::AcquisitionFailed {
            reason: Box::new(reason),
            metrics: Box::new(metrics),
        }
    }

    /// Current metrics of the active pool
    ///
    /// During a swap, connections still held from the replaced pool are not
    /// included. See [`retiring_pools`](Self::retiring_pools).
    pub fn get_metrics(&self) -> ConnectionMetrics {
        self.inner.metrics()
    }

    /// Configuration of the active pool
    pub fn config(&self) -> PoolConfiguration {
        self.inner.active_pool().config().clone()
    }

    /// Replace the active pool with one built from `config`
    ///
    /// The previous pool keeps serving connections already checked out and
    /// callers already queued on it. After `swap_grace_period` it closes once
    /// the last of them is done. Later sizing decisions use the bounds of `config`. On failure the previous pool
    /// stays active.
    pub fn apply_configuration(&self, config: PoolConfiguration) -> PoolResult<usize> {
        self.inner.apply_configuration(config)
    }

    /// Run adaptive sizing once, returning the new maximum if it changed
    pub fn evaluate_sizing(&self) -> Option<usize> {
        self.inner.evaluate_sizing()
    }

    /// Run one health check
    pub async fn health_check(&self) -> PoolResult<Duration> {
        self.inner.health_check().await
    }

    /// Run one maintenance pass
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.inner.run_maintenance().await
    }

    pub fn health_status(&self) -> HealthStatus {
        let health = &self.inner.health;
        HealthStatus::evaluate(&self.inner.metrics(), health.consecutive_failures()).with_checks(health)
    }

    /// Copy of the memory snapshot history, oldest first
    pub fn memory_history(&self) -> Vec<MemorySnapshot> {
        self.inner.snapshots.history()
    }

    /// Pools replaced by a swap and not yet drained
    pub fn retiring_pools(&self) -> usize {
        self.inner
            .retiring
            .lock()
            .iter()
            .filter(|r| !r.pool.is_closed() || r.drain.as_ref().is_some_and(|h| !h.is_finished()))
            .count()
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(&self, pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        MetricsExporter::export_prometheus(&self.get_metrics(), pool_name, tags)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the background routines and close every pool
    ///
    /// Waits for checked-out connections to be released. Calling this
    /// again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("pool manager already shut down");
            return;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.stop();
        }

        let retiring = {
            let _swap = self.inner.swap_lock.lock();
            std::mem::take(&mut *self.inner.retiring.lock())
        };
        for RetiringPool { pool, drain } in retiring {
            if let Some(drain) = drain {
                drain.abort();
                join_drains(vec![drain]).await;
            }
            pool.close().await;
        }

        self.inner.active_pool().close().await;
        self.inner.reservation.clear();

        let metrics = self.inner.metrics();
        tracing::info!(
            created = metrics.connections_created,
            destroyed = metrics.connections_destroyed,
            "pool manager shut down"
        );
    }
}

/// Builder for [`PoolManager`]
pub struct PoolManagerBuilder<F: ConnectionFactory> {
    factory: F,
    config: Option<PoolConfiguration>,
    memory: Arc<dyn MemoryProbe>,
}

impl<F: ConnectionFactory> PoolManagerBuilder<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            config: None,
            memory: Arc::new(ProcessMemoryProbe::new()),
        }
    }

    #[must_use]
    pub fn config(mut self, config: PoolConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the process memory reader
    #[must_use]
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Validate the configuration, create the first pool and start the
    /// enabled background routines
    ///
    /// Needs a Tokio runtime when either background routine is enabled.
    pub fn build(self) -> PoolResult<PoolManager<F>> {
        let config = self.config.ok_or(PoolError::MissingConnectionTarget)?;
        config.validate()?;

        let wants_tasks = config.connection_health_checks || config.idle_connection_cleanup;
        if wants_tasks && Handle::try_current().is_err() {
            return Err(PoolError::InvalidConfiguration(
                "background routines need a running Tokio runtime".to_string(),
            ));
        }

        let snapshots = Arc::new(SnapshotStore::new());
        let counters = Arc::new(LifecycleCounters::new());
        let listener: Arc<dyn PoolEventListener> = Arc::new(MetricsListener {
            snapshots: Arc::clone(&snapshots),
            counters: Arc::clone(&counters),
            memory: Arc::clone(&self.memory),
        });

        let factory = Arc::new(self.factory);
        let pool = ResourcePool::new(config.clone(), Arc::clone(&factory), Arc::clone(&listener))?;

        let inner = Arc::new(ManagerInner {
            factory,
            active: RwLock::new(pool),
            swap_lock: Mutex::new(()),
            reservation: PriorityReservationPolicy::new(),
            snapshots,
            counters,
            memory: self.memory,
            listener,
            health: HealthTracker::new(),
            retiring: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();
        if config.connection_health_checks {
            let weak = Arc::downgrade(&inner);
            tasks.push(ScheduledTask::spawn("health_check", config.health_check_interval, move || {
                let weak: Weak<ManagerInner<F>> = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        // failures are logged inside
                        let _ = inner.health_check().await;
                    }
                }
            }));
        }
        if config.idle_connection_cleanup {
            let weak = Arc::downgrade(&inner);
            tasks.push(ScheduledTask::spawn("maintenance", config.maintenance_interval, move || {
                let weak: Weak<ManagerInner<F>> = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.run_maintenance().await;
                    }
                }
            }));
        }
        *inner.tasks.lock() = tasks;

        tracing::info!(
            max = config.max_connections,
            min = config.min_connections,
            memory_scaling = config.memory_based_scaling,
            health_checks = config.connection_health_checks,
            cleanup = config.idle_connection_cleanup,
            reservation = config.priority_connection_reservation,
            "pool manager created"
        );

        Ok(PoolManager { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedMemoryProbe;
    use crate::resource::testing::MockFactory;

    fn quiet_config() -> PoolConfiguration {
        PoolConfiguration::new("mock://db")
            .with_memory_scaling(6, 20, 85.0)
            .with_min_connections(0)
            .with_health_checks(false)
            .with_idle_cleanup(false)
            .with_connect_timeout(Duration::from_millis(200))
            .with_swap_grace_period(Duration::from_millis(50))
    }

    fn manager(config: PoolConfiguration, memory_mb: f64) -> (PoolManager<MockFactory>, Arc<FixedMemoryProbe>) {
        let probe = Arc::new(FixedMemoryProbe::new(memory_mb));
        let manager = PoolManager::builder(MockFactory::default())
            .config(config)
            .memory_probe(probe.clone())
            .build()
            .unwrap();
        (manager, probe)
    }

    #[test]
    fn test_build_without_config_fails() {
        let err = PoolManager::builder(MockFactory::default()).build().err().unwrap();
        assert!(matches!(err, PoolError::MissingConnectionTarget));
    }

    #[test]
    fn test_build_with_tasks_outside_runtime_fails() {
        let config = PoolConfiguration::new("mock://db");
        let err = PoolManager::builder(MockFactory::default())
            .config(config)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_sizing_follows_memory_with_hysteresis() {
        let (manager, probe) = manager(quiet_config(), 100.0);

        drop(manager.connect_default().await.unwrap());
        assert_eq!(manager.config().max_connections, 6);

        probe.set_mb(50.0);
        drop(manager.connect_default().await.unwrap());
        assert_eq!(manager.config().max_connections, 20);

        probe.set_mb(70.0);
        assert_eq!(manager.evaluate_sizing(), None);
        assert_eq!(manager.config().max_connections, 20);

        probe.set_mb(100.0);
        assert_eq!(manager.evaluate_sizing(), Some(6));
        probe.set_mb(70.0);
        assert_eq!(manager.evaluate_sizing(), None);
        assert_eq!(manager.config().max_connections, 6);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_scaling_disabled_keeps_max() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 500.0);
        drop(manager.connect_default().await.unwrap());
        assert_eq!(manager.config().max_connections, 20);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_critical_reservation_is_accounting_only() {
        let (manager, _) = manager(quiet_config().with_max_connections(5).without_memory_scaling(), 10.0);

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(manager.connect_default().await.unwrap());
        }
        drop(held.pop());

        let metrics = manager.get_metrics();
        assert_eq!((metrics.total_connections, metrics.active_connections), (5, 4));

        let critical = manager.connect(ConnectionPriority::critical("payout")).await.unwrap();
        let metrics = manager.get_metrics();
        assert_eq!(metrics.reserved_connections, 2);
        assert_eq!(metrics.total_connections, 5);
        assert_eq!(metrics.max_connections, 5);

        drop(critical);
        drop(held);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_reservation_disabled() {
        let config = quiet_config()
            .with_max_connections(2)
            .without_memory_scaling()
            .with_priority_reservation(false);
        let (manager, _) = manager(config, 10.0);

        let _conn = manager.connect(ConnectionPriority::critical("payout")).await.unwrap();
        assert_eq!(manager.get_metrics().reserved_connections, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_acquisition_failure_carries_metrics() {
        let (manager, _) = manager(quiet_config().with_max_connections(1).without_memory_scaling(), 10.0);
        let _held = manager.connect_default().await.unwrap();

        let err = manager.connect_default().await.err().unwrap();
        match &err {
            PoolError::AcquisitionFailed { reason, metrics } => {
                assert!(matches!(**reason, PoolError::Timeout(_)));
                assert_eq!(metrics.active_connections, 1);
                assert_eq!(metrics.total_connections, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.metrics().is_some());
        assert_eq!(manager.get_metrics().acquisition_failures, 1);
        assert_eq!(manager.get_metrics().acquisitions, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_without_retry() {
        let (manager, _) = manager(quiet_config(), 10.0);
        manager.inner.factory.fail_connect.store(true, Ordering::SeqCst);

        let err = manager.connect_default().await.err().unwrap();
        assert!(matches!(err, PoolError::AcquisitionFailed { ref reason, .. } if matches!(**reason, PoolError::ConnectFailed(_))));
        assert_eq!(manager.inner.factory.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_recorded_per_connection() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 42.0);
        let a = manager.connect_default().await.unwrap();
        let b = manager.connect_default().await.unwrap();

        let history = manager.memory_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].connections, 2);
        assert_eq!(manager.get_metrics().memory_usage_per_connection_mb, 21.0);

        drop((a, b));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_swap_keeps_previous_pool() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        let err = manager
            .apply_configuration(quiet_config().with_max_connections(0))
            .unwrap_err();
        assert!(matches!(err, PoolError::ConfigurationSwapFailed(_)));
        assert_eq!(manager.config().max_connections, 20);
        assert!(manager.connect_default().await.is_ok());
    }

    #[tokio::test]
    async fn test_retired_pool_drains_after_grace() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        let held = manager.connect_default().await.unwrap();

        manager
            .apply_configuration(manager.config().with_max_connections(8))
            .unwrap();
        assert_eq!(manager.retiring_pools(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // still waiting for the checked-out connection
        assert_eq!(manager.retiring_pools(), 1);

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.retiring_pools(), 0);
        assert_eq!(manager.get_metrics().connections_destroyed, 1);
    }

    #[tokio::test]
    async fn test_maintenance_shrinks_under_pressure() {
        let config = quiet_config().with_memory_scaling(2, 20, 85.0);
        let (manager, probe) = manager(config, 10.0);

        let held: Vec<_> = futures_join(&manager, 6).await;
        drop(held);
        assert_eq!(manager.get_metrics().idle_connections, 6);

        probe.set_mb(120.0);
        let report = manager.run_maintenance().await;
        assert_eq!(report.resized_to, Some(2));
        assert_eq!(manager.config().max_connections, 2);

        manager.shutdown().await;
        assert_eq!(manager.get_metrics().total_connections, 0);
    }

    #[tokio::test]
    async fn test_maintenance_warns_about_leaks() {
        let (manager, _) = manager(quiet_config().with_max_connections(5).without_memory_scaling(), 10.0);
        let held: Vec<_> = futures_join(&manager, 5).await;

        let report = manager.run_maintenance().await;
        assert_eq!(report.resized_to, None);
        assert!(report.warnings.iter().any(|w| w.contains("possible leak")));
        assert!(!manager.health_status().is_healthy());

        drop(held);
        assert!(manager.health_status().is_healthy());
    }

    #[tokio::test]
    async fn test_maintenance_trims_history() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        for i in 0..(DEFAULT_HISTORY + 10) {
            manager.inner.snapshots.record(10.0, i);
        }
        let report = manager.run_maintenance().await;
        assert_eq!(report.trimmed, 10);
        assert_eq!(manager.memory_history().len(), DEFAULT_HISTORY);
    }

    #[tokio::test]
    async fn test_health_check_failure_is_counted() {
        let (manager, _) = manager(quiet_config(), 10.0);
        assert!(manager.health_check().await.is_ok());

        manager.inner.factory.fail_ping.store(true, Ordering::SeqCst);
        assert!(manager.health_check().await.is_err());

        let status = manager.health_status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.checks_performed, 2);
        assert_eq!(status.checks_failed, 1);
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (manager, _) = manager(quiet_config(), 10.0);
        drop(manager.connect_default().await.unwrap());

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert_eq!(manager.get_metrics().connections_destroyed, 1);
        let err = manager.connect_default().await.err().unwrap();
        assert!(matches!(err, PoolError::AcquisitionFailed { ref reason, .. } if matches!(**reason, PoolError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_applied_bounds_drive_later_sizing() {
        let (manager, _) = manager(quiet_config(), 10.0);

        let applied = quiet_config()
            .with_memory_scaling(4, 10, 200.0)
            .with_max_connections(10);
        assert_eq!(manager.apply_configuration(applied).unwrap(), 10);

        drop(manager.connect_default().await.unwrap());
        let config = manager.config();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.high_memory_max_connections, 10);
        assert_eq!(manager.evaluate_sizing(), None);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_maintenance_shrinks_to_applied_low_bound() {
        let (manager, probe) = manager(quiet_config(), 10.0);
        manager
            .apply_configuration(quiet_config().with_memory_scaling(3, 20, 150.0))
            .unwrap();

        let held: Vec<_> = futures_join(&manager, 5).await;
        drop(held);

        probe.set_mb(160.0);
        let report = manager.run_maintenance().await;
        assert_eq!(report.resized_to, Some(3));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkout_moves_to_active_pool_when_retired_pool_closed() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        let stale = manager.inner.active_pool();

        manager
            .apply_configuration(manager.config().with_max_connections(4))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stale.is_closed());

        let conn = manager.inner.acquire_from(stale).await.unwrap();
        assert_eq!(manager.get_metrics().active_connections, 1);
        assert_eq!(manager.get_metrics().max_connections, 4);

        drop(conn);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_active_pool_is_not_retried() {
        let (manager, _) = manager(quiet_config(), 10.0);
        let pool = manager.inner.active_pool();
        pool.close().await;

        let err = manager.inner.acquire_from(pool).await.err().unwrap();
        assert!(matches!(err, PoolError::PoolClosed));
    }

    #[tokio::test]
    async fn test_metrics_exclude_retiring_pool() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        let held = manager.connect_default().await.unwrap();

        manager
            .apply_configuration(manager.config().with_max_connections(8))
            .unwrap();
        let metrics = manager.get_metrics();
        assert_eq!(metrics.active_connections, 0);
        assert_eq!(metrics.max_connections, 8);
        assert_eq!(manager.retiring_pools(), 1);

        drop(held);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicked_drain_is_reported() {
        let panicking: JoinHandle<()> = tokio::spawn(async { panic!("drain failed") });
        let clean = tokio::spawn(async {});
        let aborted = tokio::spawn(tokio::time::sleep(Duration::from_secs(60)));
        aborted.abort();

        assert_eq!(join_drains(vec![panicking, clean, aborted]).await, 1);
    }

    #[tokio::test]
    async fn test_maintenance_joins_finished_drains() {
        let (manager, _) = manager(quiet_config().without_memory_scaling(), 10.0);
        manager
            .apply_configuration(manager.config().with_max_connections(8))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.run_maintenance().await;
        assert!(manager.inner.retiring.lock().is_empty());
        manager.shutdown().await;
    }

    async fn futures_join(manager: &PoolManager<MockFactory>, n: usize) -> Vec<PooledConnection<MockFactory>> {
        let mut held = Vec::with_capacity(n);
        for _ in 0..n {
            held.push(manager.connect_default().await.unwrap());
        }
        held
    }
}
