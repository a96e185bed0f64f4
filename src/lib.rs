//! # EsoxSolutions.ConnectionPool
//!
//! Memory-aware, priority-sensitive connection pool manager for async Rust
//! services that share one relational database across many tenants.
//!
//! ## Features
//!
//! - Bounded, FIFO-fair connection checkout with a connect timeout
//! - Automatic return of connections via RAII (Drop trait)
//! - Memory based pool sizing with a hysteresis band
//! - Zero-downtime resizing: new pool swapped in, old pool drained after a grace period
//! - Advisory capacity reservation for critical operations
//! - Periodic health checks and maintenance (idle reaping, warm-up, leak warnings)
//! - Metrics projection with Prometheus export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use esox_connpool::{
//!     BoxError, ConnectionFactory, ConnectionPriority, PoolConfiguration, PoolManager,
//! };
//!
//! struct Driver;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for Driver {
//!     type Connection = String;
//!
//!     async fn connect(&self, config: &PoolConfiguration) -> Result<String, BoxError> {
//!         Ok(format!("session to {}", config.connection_target))
//!     }
//!
//!     async fn ping(&self, _connection: &mut String) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), esox_connpool::PoolError> {
//! let manager = PoolManager::builder(Driver)
//!     .config(PoolConfiguration::new("postgres://app@db/app"))
//!     .build()?;
//!
//! {
//!     let conn = manager.connect(ConnectionPriority::critical("invoice_close")).await?;
//!     println!("Got: {}", *conn);
//!     // Connection automatically returned when `conn` goes out of scope
//! }
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod errors;
mod eviction;
mod health;
mod manager;
mod memory;
mod metrics;
mod priority;
mod reservation;
mod resource;
mod scheduler;
mod sizing;
mod snapshots;

pub use config::PoolConfiguration;
pub use errors::{BoxError, PoolError, PoolResult};
pub use eviction::{ConnectionMetadata, EvictionPolicy};
pub use health::{HealthStatus, LEAK_SUSPICION_RATIO, WAITING_WARN_THRESHOLD};
pub use manager::{IDLE_SHRINK_THRESHOLD, MaintenanceReport, PoolManager, PoolManagerBuilder};
pub use memory::{FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe};
#[cfg(feature = "metrics")]
pub use metrics::PrometheusMetrics;
pub use metrics::{ConnectionMetrics, MetricsExporter};
pub use priority::{ConnectionPriority, PriorityLevel};
pub use reservation::{PriorityReservationPolicy, RESERVATION_TRIGGER, RESERVED_SLOTS};
pub use resource::{
    ConnectionFactory, NoopListener, PoolEventListener, PoolStatus, PooledConnection, ResourcePool,
};
pub use scheduler::ScheduledTask;
pub use sizing::{AdaptiveSizingPolicy, HYSTERESIS_RATIO, SizingDecision};
pub use snapshots::{DEFAULT_HISTORY, HARD_CAP, LifecycleCounters, MemorySnapshot, SnapshotStore};
