//! Priority descriptors supplied with each acquisition request

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// How important an acquisition is
///
/// Priority only influences admission (reservation and sizing), never the
/// order in which waiting callers are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PriorityLevel {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl PriorityLevel {
    /// Whether this level may trigger a capacity reservation
    pub fn is_elevated(self) -> bool {
        matches!(self, PriorityLevel::High | PriorityLevel::Critical)
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityLevel::Low => "low",
            PriorityLevel::Normal => "normal",
            PriorityLevel::High => "high",
            PriorityLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Describes the caller of a single `connect` request
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionPriority, PriorityLevel};
///
/// let priority = ConnectionPriority::critical("billing_close")
///     .with_estimated_duration_ms(250);
///
/// assert_eq!(priority.level, PriorityLevel::Critical);
/// assert!(priority.level.is_elevated());
/// assert_eq!(ConnectionPriority::default().level, PriorityLevel::Normal);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionPriority {
    pub level: PriorityLevel,
    pub operation_type: String,
    pub estimated_duration_ms: u64,
    pub memory_requirement_mb: f64,
}

impl Default for ConnectionPriority {
    fn default() -> Self {
        Self {
            level: PriorityLevel::Normal,
            operation_type: "query".to_string(),
            estimated_duration_ms: 100,
            memory_requirement_mb: 1.0,
        }
    }
}

impl ConnectionPriority {
    /// Create a descriptor with the given level and operation
    pub fn new(level: PriorityLevel, operation_type: impl Into<String>) -> Self {
        Self {
            level,
            operation_type: operation_type.into(),
            ..Self::default()
        }
    }

    pub fn low(operation_type: impl Into<String>) -> Self {
        Self::new(PriorityLevel::Low, operation_type)
    }

    pub fn high(operation_type: impl Into<String>) -> Self {
        Self::new(PriorityLevel::High, operation_type)
    }

    pub fn critical(operation_type: impl Into<String>) -> Self {
        Self::new(PriorityLevel::Critical, operation_type)
    }

    pub fn with_estimated_duration_ms(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = duration_ms;
        self
    }

    pub fn with_memory_requirement_mb(mut self, memory_mb: f64) -> Self {
        self.memory_requirement_mb = memory_mb;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(PriorityLevel::Low < PriorityLevel::Normal);
        assert!(PriorityLevel::High < PriorityLevel::Critical);
        assert!(!PriorityLevel::Normal.is_elevated());
        assert!(PriorityLevel::High.is_elevated());
    }

    #[test]
    fn test_display() {
        assert_eq!(PriorityLevel::Critical.to_string(), "critical");
        assert_eq!(ConnectionPriority::low("report").level.to_string(), "low");
    }
}
