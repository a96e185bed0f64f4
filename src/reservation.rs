//! Advisory capacity reservation for elevated-priority callers

use crate::priority::{ConnectionPriority, PriorityLevel};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Free connections at or below which a critical request reserves capacity
pub const RESERVATION_TRIGGER: usize = 2;

/// Connections held back per reservation
pub const RESERVED_SLOTS: usize = 2;

/// Tracks how many connections are marked as held back
///
/// The marker is accounting only. Nothing is evicted and no caller is
/// blocked because of it.
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectionPriority, PriorityReservationPolicy};
///
/// let policy = PriorityReservationPolicy::new();
///
/// // 5 connections, 4 checked out: one free slot left
/// let reserved = policy.evaluate(&ConnectionPriority::critical("payout"), 5, 4);
/// assert_eq!(reserved, Some(2));
/// assert_eq!(policy.reserved(5), 2);
/// ```
#[derive(Debug, Default)]
pub struct PriorityReservationPolicy {
    reserved: AtomicUsize,
}

impl PriorityReservationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the marker for an incoming request
    ///
    /// Returns the new reservation when one was made.
    pub fn evaluate(
        &self,
        priority: &ConnectionPriority,
        total_connections: usize,
        active_connections: usize,
    ) -> Option<usize> {
        if priority.level != PriorityLevel::Critical {
            return None;
        }

        let available = total_connections.saturating_sub(active_connections);
        if available <= RESERVATION_TRIGGER {
            let slots = RESERVED_SLOTS.min(total_connections);
            self.reserved.store(slots, Ordering::Relaxed);
            tracing::info!(
                reserved = slots,
                available,
                total = total_connections,
                operation = %priority.operation_type,
                "reserved connections for critical operation"
            );
            Some(slots)
        } else {
            let previous = self.reserved.swap(0, Ordering::Relaxed);
            if previous > 0 {
                tracing::debug!(previous, available, "released connection reservation");
            }
            None
        }
    }

    /// Current reservation, never more than `total_connections`
    pub fn reserved(&self, total_connections: usize) -> usize {
        self.reserved.load(Ordering::Relaxed).min(total_connections)
    }

    pub fn clear(&self) {
        self.reserved.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_priority_does_not_reserve() {
        let policy = PriorityReservationPolicy::new();
        assert_eq!(policy.evaluate(&ConnectionPriority::high("export"), 5, 5), None);
        assert_eq!(policy.reserved(5), 0);
    }

    #[test]
    fn test_critical_reserves_when_nearly_exhausted() {
        let policy = PriorityReservationPolicy::new();
        assert_eq!(policy.evaluate(&ConnectionPriority::critical("payout"), 5, 3), Some(2));
        assert_eq!(policy.reserved(5), 2);
    }

    #[test]
    fn test_reservation_bounded_by_total() {
        let policy = PriorityReservationPolicy::new();
        assert_eq!(policy.evaluate(&ConnectionPriority::critical("payout"), 1, 0), Some(1));
        assert_eq!(policy.evaluate(&ConnectionPriority::critical("payout"), 0, 0), Some(0));
        assert_eq!(policy.reserved(0), 0);
    }

    #[test]
    fn test_spare_capacity_clears_marker() {
        let policy = PriorityReservationPolicy::new();
        policy.evaluate(&ConnectionPriority::critical("payout"), 5, 4);
        assert_eq!(policy.evaluate(&ConnectionPriority::critical("payout"), 10, 2), None);
        assert_eq!(policy.reserved(10), 0);
    }

    #[test]
    fn test_reported_reservation_clamped_after_shrink() {
        let policy = PriorityReservationPolicy::new();
        policy.evaluate(&ConnectionPriority::critical("payout"), 5, 5);
        assert_eq!(policy.reserved(1), 1);
        policy.clear();
        assert_eq!(policy.reserved(5), 0);
    }
}
