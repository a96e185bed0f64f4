//! Pool configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Configuration for connection pool behavior
///
/// A configuration is never mutated once a pool has been built from it.
/// Resizing produces a new value (see [`PoolConfiguration::with_max_connections`])
/// which the manager hot-swaps in.
///
/// # Examples
///
/// ```
/// use esox_connpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new("postgres://app@localhost/app")
///     .with_max_connections(30)
///     .with_min_connections(4)
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_memory_scaling(8, 30, 256.0);
///
/// assert_eq!(config.max_connections, 30);
/// assert_eq!(config.low_memory_max_connections, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfiguration {
    /// Connection target handed to the driver
    pub connection_target: String,

    /// Maximum number of live connections
    pub max_connections: usize,

    /// Number of connections kept open while idle
    pub min_connections: usize,

    /// Idle connections older than this are closed by maintenance
    pub idle_timeout: Duration,

    /// Upper bound on a single checkout, including waiting for a slot
    pub connect_timeout: Duration,

    /// Checkouts after which a connection is rotated out
    pub max_uses: Option<u64>,

    /// Age after which a connection is rotated out
    pub max_lifetime: Option<Duration>,

    /// Whether the driver should enable TCP keep-alive
    pub keep_alive: bool,

    /// Delay before the first keep-alive probe
    pub keep_alive_initial_delay: Duration,

    /// Server-side statement timeout passed to the driver
    pub statement_timeout: Duration,

    /// Client-side query timeout passed to the driver
    pub query_timeout: Duration,

    /// Enable memory based scaling of `max_connections`
    pub memory_based_scaling: bool,

    /// Maximum pool size while memory usage is above the threshold
    pub low_memory_max_connections: usize,

    /// Maximum pool size while memory usage is comfortably below the threshold
    pub high_memory_max_connections: usize,

    /// Process memory (MB) above which the pool shrinks
    pub memory_threshold_mb: f64,

    /// Run the periodic health check
    pub connection_health_checks: bool,

    /// Run the periodic maintenance routine
    pub idle_connection_cleanup: bool,

    /// Hold back capacity for critical callers
    pub priority_connection_reservation: bool,

    /// Interval of the health check routine
    pub health_check_interval: Duration,

    /// Interval of the maintenance routine
    pub maintenance_interval: Duration,

    /// How long a replaced pool stays open before it is drained
    pub swap_grace_period: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            connection_target: String::new(),
            max_connections: 20,
            min_connections: 2,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_uses: Some(7500),
            max_lifetime: None,
            keep_alive: true,
            keep_alive_initial_delay: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
            memory_based_scaling: true,
            low_memory_max_connections: 6,
            high_memory_max_connections: 20,
            memory_threshold_mb: 85.0,
            connection_health_checks: true,
            idle_connection_cleanup: true,
            priority_connection_reservation: true,
            health_check_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(120),
            swap_grace_period: Duration::from_secs(5),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration for the given target with default values
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            connection_target: target.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from the process environment
    ///
    /// `DATABASE_URL` is required. `DB_POOL_MAX`, `DB_POOL_MIN`,
    /// `DB_MEMORY_THRESHOLD_MB`, `DB_MEMORY_SCALING`, `DB_HEALTH_CHECKS`,
    /// `DB_IDLE_CLEANUP` and `DB_PRIORITY_RESERVATION` override defaults.
    pub fn from_env() -> PoolResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> PoolResult<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let target = lookup("DATABASE_URL")
            .filter(|t| !t.trim().is_empty())
            .ok_or(PoolError::MissingConnectionTarget)?;
        let mut config = Self::new(target);

        if let Some(max) = parse_var(&lookup, "DB_POOL_MAX")? {
            config.max_connections = max;
            config.high_memory_max_connections = max;
            config.low_memory_max_connections = config.low_memory_max_connections.min(max);
        }
        if let Some(min) = parse_var(&lookup, "DB_POOL_MIN")? {
            config.min_connections = min;
        }
        if let Some(threshold) = parse_var(&lookup, "DB_MEMORY_THRESHOLD_MB")? {
            config.memory_threshold_mb = threshold;
        }
        if let Some(flag) = parse_var(&lookup, "DB_MEMORY_SCALING")? {
            config.memory_based_scaling = flag;
        }
        if let Some(flag) = parse_var(&lookup, "DB_HEALTH_CHECKS")? {
            config.connection_health_checks = flag;
        }
        if let Some(flag) = parse_var(&lookup, "DB_IDLE_CLEANUP")? {
            config.idle_connection_cleanup = flag;
        }
        if let Some(flag) = parse_var(&lookup, "DB_PRIORITY_RESERVATION")? {
            config.priority_connection_reservation = flag;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values a pool cannot be built from
    pub fn validate(&self) -> PoolResult<()> {
        if self.connection_target.trim().is_empty() {
            return Err(PoolError::MissingConnectionTarget);
        }
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfiguration(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfiguration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.memory_based_scaling {
            if self.low_memory_max_connections == 0 {
                return Err(PoolError::InvalidConfiguration(
                    "low_memory_max_connections must be at least 1".to_string(),
                ));
            }
            if self.low_memory_max_connections > self.high_memory_max_connections {
                return Err(PoolError::InvalidConfiguration(format!(
                    "low_memory_max_connections ({}) exceeds high_memory_max_connections ({})",
                    self.low_memory_max_connections, self.high_memory_max_connections
                )));
            }
            if self.memory_threshold_mb.is_nan() || self.memory_threshold_mb <= 0.0 {
                return Err(PoolError::InvalidConfiguration(
                    "memory_threshold_mb must be positive".to_string(),
                ));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfiguration;
    ///
    /// let original = PoolConfiguration::new("db://local");
    /// let resized = original.clone().with_max_connections(6);
    ///
    /// assert_eq!(original.max_connections, 20);
    /// assert_eq!(resized.max_connections, 6);
    /// ```
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self.min_connections = self.min_connections.min(max);
        self
    }

    /// Set the number of connections kept warm
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the checkout timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Rotate connections after `uses` checkouts
    pub fn with_max_uses(mut self, uses: u64) -> Self {
        self.max_uses = Some(uses);
        self
    }

    /// Rotate connections after they reach `lifetime`
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Configure TCP keep-alive
    pub fn with_keep_alive(mut self, enabled: bool, initial_delay: Duration) -> Self {
        self.keep_alive = enabled;
        self.keep_alive_initial_delay = initial_delay;
        self
    }

    /// Set statement and query timeouts
    pub fn with_statement_timeouts(mut self, statement: Duration, query: Duration) -> Self {
        self.statement_timeout = statement;
        self.query_timeout = query;
        self
    }

    /// Enable memory based scaling with the given bounds
    pub fn with_memory_scaling(mut self, low: usize, high: usize, threshold_mb: f64) -> Self {
        self.memory_based_scaling = true;
        self.low_memory_max_connections = low;
        self.high_memory_max_connections = high;
        self.memory_threshold_mb = threshold_mb;
        self
    }

    /// Disable memory based scaling
    pub fn without_memory_scaling(mut self) -> Self {
        self.memory_based_scaling = false;
        self
    }

    /// Toggle the periodic health check
    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.connection_health_checks = enabled;
        self
    }

    /// Toggle the periodic maintenance routine
    pub fn with_idle_cleanup(mut self, enabled: bool) -> Self {
        self.idle_connection_cleanup = enabled;
        self
    }

    /// Toggle priority reservation
    pub fn with_priority_reservation(mut self, enabled: bool) -> Self {
        self.priority_connection_reservation = enabled;
        self
    }

    /// Set the intervals of the background routines
    pub fn with_intervals(mut self, health_check: Duration, maintenance: Duration) -> Self {
        self.health_check_interval = health_check;
        self.maintenance_interval = maintenance;
        self
    }

    /// Set how long a replaced pool stays open before it is drained
    pub fn with_swap_grace_period(mut self, grace: Duration) -> Self {
        self.swap_grace_period = grace;
        self
    }
}

fn parse_var<L, T>(lookup: &L, key: &str) -> PoolResult<Option<T>>
where
    L: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PoolError::InvalidConfiguration(format!("{key} has invalid value {raw:?}"))),
    }
}
