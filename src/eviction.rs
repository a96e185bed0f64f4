//! Eviction rules for pooled connections

use crate::config::PoolConfiguration;
use std::time::{Duration, Instant};

/// When a pooled connection should be closed instead of reused
///
/// # Examples
///
/// ```
/// use esox_connpool::{EvictionPolicy, PoolConfiguration};
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new("db://local")
///     .with_idle_timeout(Duration::from_secs(30))
///     .with_max_uses(500);
///
/// let policy = EvictionPolicy::from_config(&config);
/// assert_eq!(policy.max_uses, Some(500));
/// assert_eq!(policy.idle_timeout, Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Close connections idle for longer than this
    pub idle_timeout: Option<Duration>,

    /// Rotate connections older than this
    pub max_lifetime: Option<Duration>,

    /// Rotate connections checked out this many times
    pub max_uses: Option<u64>,
}

impl EvictionPolicy {
    pub fn from_config(config: &PoolConfiguration) -> Self {
        Self {
            idle_timeout: (!config.idle_timeout.is_zero()).then_some(config.idle_timeout),
            max_lifetime: config.max_lifetime,
            max_uses: config.max_uses,
        }
    }
}

/// Lifecycle bookkeeping carried alongside each physical connection
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: u64,
    pub created_at: Instant,
    pub last_used: Instant,
    pub uses: u64,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            uses: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn checked_out(&mut self) {
        self.uses += 1;
        self.touch();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Whether the connection has reached its lifetime or use limit
    pub fn needs_rotation(&self, policy: &EvictionPolicy) -> bool {
        let worn_out = policy.max_uses.is_some_and(|max| self.uses >= max);
        let too_old = policy.max_lifetime.is_some_and(|max| self.age() > max);
        worn_out || too_old
    }

    /// Whether an idle connection should be closed by maintenance
    pub fn is_expired(&self, policy: &EvictionPolicy) -> bool {
        self.needs_rotation(policy)
            || policy
                .idle_timeout
                .is_some_and(|timeout| self.idle_for() > timeout)
    }
}
