//! Error types for the connection pool

use crate::metrics::ConnectionMetrics;
use thiserror::Error;

/// Boxed error returned by connection drivers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("No connection target configured")]
    MissingConnectionTarget,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Connection checkout timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Failed to open connection: {0}")]
    ConnectFailed(String),

    #[error("Failed to acquire connection: {reason}")]
    AcquisitionFailed {
        reason: Box<PoolError>,
        metrics: Box<ConnectionMetrics>,
    },

    #[error("Configuration swap failed: {0}")]
    ConfigurationSwapFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),
}

impl PoolError {
    /// Metrics captured when an acquisition failed
    pub fn metrics(&self) -> Option<&ConnectionMetrics> {
        match self {
            PoolError::AcquisitionFailed { metrics, .. } => Some(metrics),
            _ => None,
        }
    }

    /// Whether the error was raised while building the pool
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PoolError::MissingConnectionTarget | PoolError::InvalidConfiguration(_)
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
