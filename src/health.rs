//! Health monitoring for the connection pool

use crate::metrics::ConnectionMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Waiting callers above which a pressure warning is raised
pub const WAITING_WARN_THRESHOLD: usize = 5;

/// Share of checked-out connections above which a leak is suspected
pub const LEAK_SUSPICION_RATIO: f64 = 0.8;

/// Health status of the connection pool
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionMetrics, HealthStatus};
///
/// let metrics = ConnectionMetrics {
///     total_connections: 10,
///     active_connections: 9,
///     idle_connections: 1,
///     waiting_clients: 7,
///     max_connections: 10,
///     ..Default::default()
/// };
///
/// let health = HealthStatus::evaluate(&metrics, 0);
/// assert!(!health.is_healthy());
/// assert!(health.leak_suspected);
/// assert_eq!(health.warning_count, 2);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Checked-out share of the configured maximum (0.0 to 1.0)
    pub utilization: f64,

    /// Almost every open connection is checked out
    pub leak_suspected: bool,

    /// Health checks failed in a row
    pub consecutive_failures: u64,

    pub checks_performed: u64,
    pub checks_failed: u64,

    /// Round trip of the last successful health check
    pub last_check_latency: Duration,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    pub fn evaluate(metrics: &ConnectionMetrics, consecutive_failures: u64) -> Self {
        let utilization = if metrics.max_connections > 0 {
            metrics.active_connections as f64 / metrics.max_connections as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();

        if metrics.waiting_clients > WAITING_WARN_THRESHOLD {
            warnings.push(format!(
                "{} clients waiting for a connection",
                metrics.waiting_clients
            ));
        }

        let leak_suspected = metrics.total_connections > 0
            && metrics.active_connections as f64 > LEAK_SUSPICION_RATIO * metrics.total_connections as f64;
        if leak_suspected {
            warnings.push(format!(
                "{} of {} connections checked out, possible leak",
                metrics.active_connections, metrics.total_connections
            ));
        }

        if consecutive_failures > 0 {
            warnings.push(format!("{consecutive_failures} consecutive health check failures"));
        }

        Self {
            is_healthy: warnings.is_empty(),
            warning_count: warnings.len(),
            utilization,
            leak_suspected,
            consecutive_failures,
            checks_performed: 0,
            checks_failed: 0,
            last_check_latency: Duration::ZERO,
            warnings,
        }
    }

    /// Fill in the health check history from `tracker`
    pub(crate) fn with_checks(mut self, tracker: &HealthTracker) -> Self {
        self.checks_performed = tracker.checks_performed();
        self.checks_failed = tracker.checks_failed();
        self.last_check_latency = tracker.last_latency();
        self
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

/// Counters fed by the health check routine
#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    checks_performed: AtomicU64,
    checks_failed: AtomicU64,
    consecutive_failures: AtomicU64,
    last_latency_us: AtomicU64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.checks_performed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.last_latency_us.store(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.checks_performed.fetch_add(1, Ordering::Relaxed);
        self.checks_failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checks_performed(&self) -> u64 {
        self.checks_performed.load(Ordering::Relaxed)
    }

    pub fn checks_failed(&self) -> u64 {
        self.checks_failed.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_latency(&self) -> Duration {
        Duration::from_micros(self.last_latency_us.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_pool_is_healthy() {
        let metrics = ConnectionMetrics {
            total_connections: 4,
            active_connections: 1,
            idle_connections: 3,
            max_connections: 10,
            ..Default::default()
        };
        let health = HealthStatus::evaluate(&metrics, 0);
        assert!(health.is_healthy());
        assert!(!health.leak_suspected);
        assert_eq!(health.utilization, 0.1);
    }

    #[test]
    fn test_leak_threshold_is_strict() {
        let metrics = ConnectionMetrics {
            total_connections: 5,
            active_connections: 4,
            idle_connections: 1,
            max_connections: 5,
            ..Default::default()
        };
        // 4 is exactly 0.8 * 5
        assert!(!HealthStatus::evaluate(&metrics, 0).leak_suspected);
    }

    #[test]
    fn test_failures_reported() {
        let tracker = HealthTracker::new();
        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(tracker.consecutive_failures(), 2);

        let health = HealthStatus::evaluate(&ConnectionMetrics::default(), tracker.consecutive_failures());
        assert!(!health.is_healthy());

        tracker.record_success(Duration::from_millis(3));
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.checks_performed(), 3);
        assert_eq!(tracker.checks_failed(), 2);
        assert_eq!(tracker.last_latency(), Duration::from_millis(3));

        let health = HealthStatus::evaluate(&ConnectionMetrics::default(), 0).with_checks(&tracker);
        assert!(health.is_healthy());
        assert_eq!((health.checks_performed, health.checks_failed), (3, 2));
        assert_eq!(health.last_check_latency, Duration::from_millis(3));
    }
}
