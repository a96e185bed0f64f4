//! Memory snapshot history and lifecycle counters

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Entries kept after a maintenance trim
pub const DEFAULT_HISTORY: usize = 100;

/// Entries never exceeded, even between trims
pub const HARD_CAP: usize = 1000;

/// Process memory and pool size at the moment a connection was opened
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemorySnapshot {
    pub timestamp: SystemTime,
    pub memory_mb: f64,
    pub connections: usize,
}

/// Bounded FIFO history of [`MemorySnapshot`]s
///
/// # Examples
///
/// ```
/// use esox_connpool::SnapshotStore;
///
/// let store = SnapshotStore::with_capacity(2);
/// store.record(40.0, 1);
/// store.record(42.0, 2);
/// store.record(45.0, 3);
///
/// assert_eq!(store.len(), 2);
/// assert_eq!(store.most_recent().unwrap().connections, 3);
/// assert_eq!(store.oldest().unwrap().connections, 2);
/// ```
#[derive(Debug)]
pub struct SnapshotStore {
    entries: Mutex<VecDeque<MemorySnapshot>>,
    capacity: usize,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::with_capacity(HARD_CAP)
    }

    /// Create a store that never holds more than `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY))),
            capacity,
        }
    }

    /// Append a snapshot taken now
    pub fn record(&self, memory_mb: f64, connections: usize) {
        self.push(MemorySnapshot {
            timestamp: SystemTime::now(),
            memory_mb,
            connections,
        });
    }

    /// Append a snapshot, evicting the oldest entries past capacity
    pub fn push(&self, snapshot: MemorySnapshot) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(snapshot);
    }

    pub fn most_recent(&self) -> Option<MemorySnapshot> {
        self.entries.lock().back().cloned()
    }

    pub fn oldest(&self) -> Option<MemorySnapshot> {
        self.entries.lock().front().cloned()
    }

    /// Drop the oldest entries until at most `max_entries` remain
    ///
    /// Returns the number of entries removed.
    pub fn trim(&self, max_entries: usize) -> usize {
        let mut entries = self.entries.lock();
        let excess = entries.len().saturating_sub(max_entries);
        entries.drain(..excess);
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the retained history, oldest first
    pub fn history(&self) -> Vec<MemorySnapshot> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide connection lifecycle counters
#[derive(Debug, Default)]
pub struct LifecycleCounters {
    connections_created: AtomicU64,
    connections_destroyed: AtomicU64,
    total_connection_time_ms: AtomicU64,
    acquisitions: AtomicU64,
    acquisition_failures: AtomicU64,
    total_wait_us: AtomicU64,
}

impl LifecycleCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self, lifetime: Duration) {
        let millis = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
        self.total_connection_time_ms.fetch_add(millis, Ordering::Relaxed);
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful checkout and how long the caller waited
    pub fn record_acquisition(&self, wait: Duration) {
        let micros = u64::try_from(wait.as_micros()).unwrap_or(u64::MAX);
        self.total_wait_us.fetch_add(micros, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_failure(&self) {
        self.acquisition_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::Relaxed)
    }

    pub fn connections_destroyed(&self) -> u64 {
        self.connections_destroyed.load(Ordering::Relaxed)
    }

    pub fn total_connection_time_ms(&self) -> u64 {
        self.total_connection_time_ms.load(Ordering::Relaxed)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn acquisition_failures(&self) -> u64 {
        self.acquisition_failures.load(Ordering::Relaxed)
    }

    /// Mean checkout wait of successful acquisitions
    pub fn average_wait_ms(&self) -> f64 {
        let acquisitions = self.acquisitions();
        if acquisitions == 0 {
            return 0.0;
        }
        self.total_wait_us.load(Ordering::Relaxed) as f64 / 1000.0 / acquisitions as f64
    }

    /// Mean lifetime of destroyed connections, 0 when none were destroyed
    pub fn average_lifetime_ms(&self) -> f64 {
        let destroyed = self.connections_destroyed();
        if destroyed == 0 {
            return 0.0;
        }
        self.total_connection_time_ms() as f64 / destroyed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_trim_drops_oldest_first() {
        let store = SnapshotStore::new();
        for i in 0..10 {
            store.record(i as f64, i);
        }

        assert_eq!(store.trim(4), 6);
        let kept: Vec<usize> = store.history().iter().map(|s| s.connections).collect();
        assert_eq!(kept, vec![6, 7, 8, 9]);
        assert_eq!(store.trim(4), 0);
    }

    #[test]
    fn test_hard_cap() {
        let store = SnapshotStore::new();
        for i in 0..(HARD_CAP + 25) {
            store.record(1.0, i);
        }
        assert_eq!(store.len(), HARD_CAP);
        assert_eq!(store.oldest().unwrap().connections, 25);
    }

    #[test]
    fn test_empty_store() {
        let store = SnapshotStore::default();
        assert!(store.is_empty());
        assert!(store.most_recent().is_none());
        assert_eq!(store.trim(0), 0);
    }

    #[test]
    fn test_average_lifetime() {
        let counters = LifecycleCounters::new();
        assert_eq!(counters.average_lifetime_ms(), 0.0);

        counters.record_created();
        counters.record_created();
        counters.record_destroyed(Duration::from_millis(100));
        counters.record_destroyed(Duration::from_millis(300));

        assert_eq!(counters.connections_created(), 2);
        assert_eq!(counters.connections_destroyed(), 2);
        assert_eq!(counters.average_lifetime_ms(), 200.0);
    }

    #[test]
    fn test_acquisition_counters() {
        let counters = LifecycleCounters::new();
        assert_eq!(counters.average_wait_ms(), 0.0);

        counters.record_acquisition(Duration::from_millis(2));
        counters.record_acquisition(Duration::from_millis(4));
        counters.record_acquisition_failure();

        assert_eq!(counters.acquisitions(), 2);
        assert_eq!(counters.acquisition_failures(), 1);
        assert_eq!(counters.average_wait_ms(), 3.0);
    }

    proptest! {
        #[test]
        fn prop_history_never_exceeds_cap(cap in 1usize..50, events in 0usize..300) {
            let store = SnapshotStore::with_capacity(cap);
            let mut last_oldest = None;
            for i in 0..events {
                store.record(1.0, i);
                prop_assert!(store.len() <= cap);
                let oldest = store.oldest().map(|s| s.connections);
                if let (Some(prev), Some(now)) = (last_oldest, oldest) {
                    prop_assert!(now >= prev);
                }
                last_oldest = oldest;
            }
            prop_assert_eq!(store.len(), events.min(cap));
        }
    }
}
