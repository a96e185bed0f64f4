//! Memory driven sizing of the pool maximum

use crate::config::PoolConfiguration;

/// Fraction of the threshold below which the pool grows again
pub const HYSTERESIS_RATIO: f64 = 0.7;

/// Outcome of a sizing evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingDecision {
    Unchanged,
    Resize(usize),
}

/// Picks the maximum pool size from process memory usage
///
/// Between `0.7 * threshold` and `threshold` the current maximum is kept, so
/// readings that hover around one edge do not flip the pool back and forth.
///
/// # Examples
///
/// ```
/// use esox_connpool::{AdaptiveSizingPolicy, SizingDecision};
///
/// let policy = AdaptiveSizingPolicy::new(6, 20, 85.0);
///
/// assert_eq!(policy.target(100.0, 20), 6);
/// assert_eq!(policy.target(50.0, 6), 20);
/// assert_eq!(policy.target(70.0, 6), 6);
/// assert_eq!(policy.decide(70.0, 20), SizingDecision::Unchanged);
/// assert_eq!(policy.decide(100.0, 20), SizingDecision::Resize(6));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSizingPolicy {
    low_memory_max: usize,
    high_memory_max: usize,
    threshold_mb: f64,
}

impl AdaptiveSizingPolicy {
    pub fn new(low_memory_max: usize, high_memory_max: usize, threshold_mb: f64) -> Self {
        Self {
            low_memory_max,
            high_memory_max,
            threshold_mb,
        }
    }

    pub fn from_config(config: &PoolConfiguration) -> Self {
        Self::new(
            config.low_memory_max_connections,
            config.high_memory_max_connections,
            config.memory_threshold_mb,
        )
    }

    pub fn low_memory_max(&self) -> usize {
        self.low_memory_max
    }

    pub fn high_memory_max(&self) -> usize {
        self.high_memory_max
    }

    pub fn threshold_mb(&self) -> f64 {
        self.threshold_mb
    }

    /// Whether `memory_mb` is above the configured threshold
    pub fn is_under_pressure(&self, memory_mb: f64) -> bool {
        memory_mb > self.threshold_mb
    }

    /// Maximum pool size for the given reading
    pub fn target(&self, memory_mb: f64, current_max: usize) -> usize {
        if memory_mb > self.threshold_mb {
            self.low_memory_max
        } else if memory_mb < self.threshold_mb * HYSTERESIS_RATIO {
            self.high_memory_max
        } else {
            current_max
        }
    }

    pub fn decide(&self, memory_mb: f64, current_max: usize) -> SizingDecision {
        let target = self.target(memory_mb, current_max);
        if target == current_max {
            SizingDecision::Unchanged
        } else {
            SizingDecision::Resize(target)
        }
    }
}
