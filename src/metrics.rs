//! Metrics projection and export for the pool manager

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::resource::PoolStatus;
use crate::snapshots::{LifecycleCounters, MemorySnapshot};
use std::collections::HashMap;

/// Derived view of pool state
///
/// Always recomputed from the live pool and the snapshot history, never
/// stored.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionMetrics {
    /// Connections checked out plus connections idle
    pub total_connections: usize,

    /// Connections currently checked out
    pub active_connections: usize,

    /// Connections open and waiting to be checked out
    pub idle_connections: usize,

    /// Callers waiting for a free slot
    pub waiting_clients: usize,

    /// Process memory divided by the pool size at the last connection creation
    pub memory_usage_per_connection_mb: f64,

    /// Share of open connections doing work (0.0 to 1.0)
    pub pool_efficiency: f64,

    /// Mean lifetime of closed connections
    pub average_connection_lifetime_ms: f64,

    /// Configured maximum of the active pool
    pub max_connections: usize,

    /// Connections marked as held back for critical callers
    pub reserved_connections: usize,

    pub connections_created: u64,

    pub connections_destroyed: u64,

    /// Successful checkouts through the manager
    pub acquisitions: u64,

    /// Checkouts that failed and were reported to the caller
    pub acquisition_failures: u64,

    /// Mean time callers waited for a successful checkout
    pub average_wait_ms: f64,
}

impl ConnectionMetrics {
    pub(crate) fn project(
        status: PoolStatus,
        latest: Option<&MemorySnapshot>,
        counters: &LifecycleCounters,
        reserved: usize,
    ) -> Self {
        let pool_efficiency = if status.total > 0 {
            status.active as f64 / status.total as f64
        } else {
            0.0
        };

        let memory_usage_per_connection_mb = latest
            .filter(|snapshot| snapshot.connections > 0)
            .map(|snapshot| snapshot.memory_mb / snapshot.connections as f64)
            .unwrap_or(0.0);

        Self {
            total_connections: status.total,
            active_connections: status.active,
            idle_connections: status.idle,
            waiting_clients: status.waiting,
            memory_usage_per_connection_mb,
            pool_efficiency,
            average_connection_lifetime_ms: counters.average_lifetime_ms(),
            max_connections: status.max,
            reserved_connections: reserved.min(status.total),
            connections_created: counters.connections_created(),
            connections_destroyed: counters.connections_destroyed(),
            acquisitions: counters.acquisitions(),
            acquisition_failures: counters.acquisition_failures(),
            average_wait_ms: counters.average_wait_ms(),
        }
    }

    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_connections".to_string(), self.total_connections.to_string());
        metrics.insert("active_connections".to_string(), self.active_connections.to_string());
        metrics.insert("idle_connections".to_string(), self.idle_connections.to_string());
        metrics.insert("waiting_clients".to_string(), self.waiting_clients.to_string());
        metrics.insert(
            "memory_usage_per_connection_mb".to_string(),
            format!("{:.2}", self.memory_usage_per_connection_mb),
        );
        metrics.insert("pool_efficiency".to_string(), format!("{:.2}", self.pool_efficiency));
        metrics.insert(
            "average_connection_lifetime_ms".to_string(),
            format!("{:.0}", self.average_connection_lifetime_ms),
        );
        metrics.insert("max_connections".to_string(), self.max_connections.to_string());
        metrics.insert("reserved_connections".to_string(), self.reserved_connections.to_string());
        metrics.insert("connections_created".to_string(), self.connections_created.to_string());
        metrics.insert("connections_destroyed".to_string(), self.connections_destroyed.to_string());
        metrics.insert("acquisitions".to_string(), self.acquisitions.to_string());
        metrics.insert("acquisition_failures".to_string(), self.acquisition_failures.to_string());
        metrics.insert("average_wait_ms".to_string(), format!("{:.2}", self.average_wait_ms));
        metrics
    }
}

/// Metrics exporter for Prometheus text format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::{ConnectionMetrics, MetricsExporter};
    /// use std::collections::HashMap;
    ///
    /// let metrics = ConnectionMetrics {
    ///     total_connections: 5,
    ///     active_connections: 4,
    ///     idle_connections: 1,
    ///     ..Default::default()
    /// };
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("tenant".to_string(), "acme".to_string());
    ///
    /// let output = MetricsExporter::export_prometheus(&metrics, "primary", Some(&tags));
    /// assert!(output.contains("connpool_connections_active{pool=\"primary\",tenant=\"acme\"} 4"));
    /// ```
    pub fn export_prometheus(
        metrics: &ConnectionMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges: [(&str, &str, String); 8] = [
            ("connpool_connections_total", "Open connections", metrics.total_connections.to_string()),
            ("connpool_connections_active", "Checked out connections", metrics.active_connections.to_string()),
            ("connpool_connections_idle", "Idle connections", metrics.idle_connections.to_string()),
            ("connpool_waiting_clients", "Callers waiting for a connection", metrics.waiting_clients.to_string()),
            ("connpool_connections_max", "Configured maximum pool size", metrics.max_connections.to_string()),
            ("connpool_connections_reserved", "Connections reserved for critical callers", metrics.reserved_connections.to_string()),
            ("connpool_efficiency", "Share of open connections in use", format!("{:.2}", metrics.pool_efficiency)),
            (
                "connpool_memory_per_connection_mb",
                "Process memory per connection in MB",
                format!("{:.2}", metrics.memory_usage_per_connection_mb),
            ),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        // Counter metrics
        output.push_str("# HELP connpool_connections_created_total Connections opened\n");
        output.push_str("# TYPE connpool_connections_created_total counter\n");
        output.push_str(&format!(
            "connpool_connections_created_total{{{}}} {}\n",
            labels, metrics.connections_created
        ));

        output.push_str("# HELP connpool_connections_destroyed_total Connections closed\n");
        output.push_str("# TYPE connpool_connections_destroyed_total counter\n");
        output.push_str(&format!(
            "connpool_connections_destroyed_total{{{}}} {}\n",
            labels, metrics.connections_destroyed
        ));

        output.push_str("# HELP connpool_acquisitions_total Successful checkouts\n");
        output.push_str("# TYPE connpool_acquisitions_total counter\n");
        output.push_str(&format!(
            "connpool_acquisitions_total{{{}}} {}\n",
            labels, metrics.acquisitions
        ));

        output.push_str("# HELP connpool_acquisition_failures_total Failed checkouts\n");
        output.push_str("# TYPE connpool_acquisition_failures_total counter\n");
        output.push_str(&format!(
            "connpool_acquisition_failures_total{{{}}} {}\n",
            labels, metrics.acquisition_failures
        ));

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut sorted: Vec<_> = tags.iter().collect();
            sorted.sort();
            for (key, value) in sorted {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Gauges registered on a [`prometheus::Registry`]
#[cfg(feature = "metrics")]
pub struct PrometheusMetrics {
    total: prometheus::IntGauge,
    active: prometheus::IntGauge,
    idle: prometheus::IntGauge,
    waiting: prometheus::IntGauge,
    max: prometheus::IntGauge,
    reserved: prometheus::IntGauge,
    efficiency: prometheus::Gauge,
    average_lifetime_ms: prometheus::Gauge,
}

#[cfg(feature = "metrics")]
impl PrometheusMetrics {
    /// Create the gauges and register them, each labelled with `pool`
    pub fn register(registry: &prometheus::Registry, pool_name: &str) -> prometheus::Result<Self> {
        let int_gauge = |name: &str, help: &str| -> prometheus::Result<prometheus::IntGauge> {
            let gauge = prometheus::IntGauge::with_opts(
                prometheus::Opts::new(name, help).const_label("pool", pool_name),
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let float_gauge = |name: &str, help: &str| -> prometheus::Result<prometheus::Gauge> {
            let gauge = prometheus::Gauge::with_opts(
                prometheus::Opts::new(name, help).const_label("pool", pool_name),
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            total: int_gauge("connpool_connections_total", "Open connections")?,
            active: int_gauge("connpool_connections_active", "Checked out connections")?,
            idle: int_gauge("connpool_connections_idle", "Idle connections")?,
            waiting: int_gauge("connpool_waiting_clients", "Callers waiting for a connection")?,
            max: int_gauge("connpool_connections_max", "Configured maximum pool size")?,
            reserved: int_gauge("connpool_connections_reserved", "Connections reserved for critical callers")?,
            efficiency: float_gauge("connpool_efficiency", "Share of open connections in use")?,
            average_lifetime_ms: float_gauge(
                "connpool_connection_lifetime_ms",
                "Mean lifetime of closed connections",
            )?,
        })
    }

    /// Refresh every gauge from a metrics projection
    pub fn update(&self, metrics: &ConnectionMetrics) {
        self.total.set(metrics.total_connections as i64);
        self.active.set(metrics.active_connections as i64);
        self.idle.set(metrics.idle_connections as i64);
        self.waiting.set(metrics.waiting_clients as i64);
        self.max.set(metrics.max_connections as i64);
        self.reserved.set(metrics.reserved_connections as i64);
        self.efficiency.set(metrics.pool_efficiency);
        self.average_lifetime_ms.set(metrics.average_connection_lifetime_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn status(idle: usize, active: usize) -> PoolStatus {
        PoolStatus {
            idle,
            active,
            total: idle + active,
            waiting: 0,
            max: 10,
        }
    }

    #[test]
    fn test_projection() {
        let counters = LifecycleCounters::new();
        counters.record_created();
        counters.record_destroyed(Duration::from_millis(500));
        let snapshot = MemorySnapshot {
            timestamp: SystemTime::now(),
            memory_mb: 80.0,
            connections: 4,
        };

        let metrics = ConnectionMetrics::project(status(1, 3), Some(&snapshot), &counters, 2);
        assert_eq!(metrics.total_connections, 4);
        assert_eq!(metrics.pool_efficiency, 0.75);
        assert_eq!(metrics.memory_usage_per_connection_mb, 20.0);
        assert_eq!(metrics.average_connection_lifetime_ms, 500.0);
        assert_eq!(metrics.reserved_connections, 2);
    }

    #[test]
    fn test_projection_of_empty_pool() {
        let metrics = ConnectionMetrics::project(status(0, 0), None, &LifecycleCounters::new(), 2);
        assert_eq!(metrics.pool_efficiency, 0.0);
        assert_eq!(metrics.memory_usage_per_connection_mb, 0.0);
        assert_eq!(metrics.reserved_connections, 0);
    }

    #[test]
    fn test_export_map() {
        let metrics = ConnectionMetrics {
            total_connections: 3,
            pool_efficiency: 1.0 / 3.0,
            ..Default::default()
        };
        let exported = metrics.export();
        assert_eq!(exported["total_connections"], "3");
        assert_eq!(exported["pool_efficiency"], "0.33");
    }

    #[test]
    fn test_prometheus_text_labels_sorted() {
        let mut tags = HashMap::new();
        tags.insert("zone".to_string(), "eu".to_string());
        tags.insert("app".to_string(), "crm".to_string());

        let output = MetricsExporter::export_prometheus(&ConnectionMetrics::default(), "main", Some(&tags));
        assert!(output.contains("connpool_connections_total{pool=\"main\",app=\"crm\",zone=\"eu\"} 0"));
        assert!(output.contains("# TYPE connpool_connections_created_total counter"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_registry() {
        use prometheus::Encoder;

        let registry = prometheus::Registry::new();
        let gauges = PrometheusMetrics::register(&registry, "main").unwrap();
        gauges.update(&ConnectionMetrics {
            total_connections: 7,
            active_connections: 2,
            ..Default::default()
        });

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("connpool_connections_total{pool=\"main\"} 7"));
        assert!(text.contains("connpool_connections_active{pool=\"main\"} 2"));
    }
}
