//! Process memory readings used by adaptive sizing

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of the current process memory usage in megabytes
pub trait MemoryProbe: Send + Sync {
    fn current_mb(&self) -> f64;
}

/// Reads the resident set size of the current process
///
/// Platforms where the process cannot be found report 0.0, which keeps the
/// pool at its high-memory bound.
pub struct ProcessMemoryProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMemoryProbe").field("pid", &self.pid).finish()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_mb(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(self.pid)
            .map(|process| bytes_to_mb(process.memory()))
            .unwrap_or(0.0)
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// A settable reading, for simulations and tests
///
/// # Examples
///
/// ```
/// use esox_connpool::{FixedMemoryProbe, MemoryProbe};
///
/// let probe = FixedMemoryProbe::new(50.0);
/// assert_eq!(probe.current_mb(), 50.0);
///
/// probe.set_mb(100.0);
/// assert_eq!(probe.current_mb(), 100.0);
/// ```
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bits: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(memory_mb: f64) -> Self {
        Self {
            bits: AtomicU64::new(memory_mb.to_bits()),
        }
    }

    pub fn set_mb(&self, memory_mb: f64) {
        self.bits.store(memory_mb.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn current_mb(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(50 * 1024 * 1024), 50.0);
        assert_eq!(bytes_to_mb(0), 0.0);
    }

    #[test]
    fn test_process_probe_reads_own_process() {
        let probe = ProcessMemoryProbe::new();
        // the test binary is resident, so it uses some memory
        assert!(probe.current_mb() > 0.0);
    }
}
