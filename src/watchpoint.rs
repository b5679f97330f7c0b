//! Watchpoint Registry
//!
//! When a guard byte is found disturbed, the corrupted address and its
//! current contents are recorded here. After the epoch rolls back, the
//! registry's entries are armed as hardware watchpoints through the
//! [`WatchpointAssist`] collaborator, so the re-executed epoch traps at the
//! exact store that caused the corruption.

use parking_lot::Mutex;

use crate::log;

/// An address to monitor together with the value observed at detection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    /// Word-aligned address to monitor.
    pub addr: usize,
    /// Word value at the address when the corruption was detected.
    pub expected: usize,
}

/// Hardware arming interface. Production implementations program debug
/// registers; tests substitute a recorder.
pub trait WatchpointAssist: Send + Sync {
    /// Arm a watchpoint. Returns whether the hardware accepted it.
    fn arm(&self, watchpoint: &Watchpoint) -> bool;
}

/// Default assist: records and logs arm requests without touching hardware.
#[derive(Debug, Default)]
pub struct LoggingAssist {
    armed: Mutex<Vec<Watchpoint>>,
}

impl LoggingAssist {
    /// Create a new logging assist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watchpoints that have been armed through this assist.
    pub fn armed(&self) -> Vec<Watchpoint> {
        self.armed.lock().clone()
    }
}

impl WatchpointAssist for LoggingAssist {
    fn arm(&self, watchpoint: &Watchpoint) -> bool {
        log::entry(log::LogLevel::Info, "arming watchpoint")
            .field_addr("addr", watchpoint.addr)
            .field_addr("expected", watchpoint.expected)
            .emit();
        self.armed.lock().push(*watchpoint);
        true
    }
}

/// Bounded registry of watchpoints gathered during an epoch.
pub struct WatchpointRegistry {
    slots: Mutex<Vec<Watchpoint>>,
    capacity: usize,
    /// Set when a watchpoint is recorded; forces the epoch to roll back.
    pending: std::sync::atomic::AtomicBool,
}

impl WatchpointRegistry {
    /// Create a registry holding up to `capacity` watchpoints.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            pending: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Record a corrupted address. Duplicate addresses and entries beyond
    /// capacity are dropped (the first few watchpoints carry the diagnostic
    /// value). Returns whether the entry was stored.
    pub fn add_watchpoint(&self, addr: usize, expected: usize) -> bool {
        let mut slots = self.slots.lock();
        if slots.iter().any(|w| w.addr == addr) {
            self.pending.store(true, std::sync::atomic::Ordering::Release);
            return false;
        }
        if slots.len() >= self.capacity {
            log::entry(log::LogLevel::Warn, "watchpoint registry full, dropping")
                .field_addr("addr", addr)
                .emit();
            self.pending.store(true, std::sync::atomic::Ordering::Release);
            return false;
        }
        slots.push(Watchpoint { addr, expected });
        self.pending.store(true, std::sync::atomic::Ordering::Release);
        true
    }

    /// Whether corruption was recorded during this epoch, requiring a
    /// rollback at the next commit check.
    pub fn has_to_rollback(&self) -> bool {
        self.pending.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Arm every recorded watchpoint. Called on the rollback path, after
    /// memory has been restored. Clears the pending flag: from here on the
    /// entries are live traps, not an undecided detection.
    pub fn install_watchpoints(&self, assist: &dyn WatchpointAssist) -> usize {
        let slots = self.slots.lock();
        let mut armed = 0;
        for watchpoint in slots.iter() {
            if assist.arm(watchpoint) {
                armed += 1;
            }
        }
        self.pending.store(false, std::sync::atomic::Ordering::Release);
        armed
    }

    /// Drop all entries. Called on a successful commit.
    pub fn clear(&self) {
        self.slots.lock().clear();
        self.pending.store(false, std::sync::atomic::Ordering::Release);
    }

    /// Number of recorded watchpoints.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Snapshot of the recorded watchpoints.
    pub fn entries(&self) -> Vec<Watchpoint> {
        self.slots.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let registry = WatchpointRegistry::new(4);
        assert!(!registry.has_to_rollback());
        assert!(registry.add_watchpoint(0x1000, 0xAA));
        assert!(registry.has_to_rollback());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0], Watchpoint { addr: 0x1000, expected: 0xAA });
    }

    #[test]
    fn test_duplicates_dropped() {
        let registry = WatchpointRegistry::new(4);
        assert!(registry.add_watchpoint(0x1000, 0xAA));
        assert!(!registry.add_watchpoint(0x1000, 0xBB));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_to_rollback());
    }

    #[test]
    fn test_capacity_bounded() {
        let registry = WatchpointRegistry::new(2);
        assert!(registry.add_watchpoint(0x1000, 0));
        assert!(registry.add_watchpoint(0x2000, 0));
        assert!(!registry.add_watchpoint(0x3000, 0));
        assert_eq!(registry.len(), 2);
        // Still demands a rollback even though the entry was dropped.
        assert!(registry.has_to_rollback());
    }

    #[test]
    fn test_install_arms_and_settles() {
        let registry = WatchpointRegistry::new(4);
        registry.add_watchpoint(0x1000, 0x11);
        registry.add_watchpoint(0x2000, 0x22);

        let assist = LoggingAssist::new();
        let armed = registry.install_watchpoints(&assist);
        assert_eq!(armed, 2);
        assert_eq!(assist.armed().len(), 2);
        // Armed entries no longer demand a rollback by themselves.
        assert!(!registry.has_to_rollback());
        // Entries survive until the next successful commit.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear_on_commit() {
        let registry = WatchpointRegistry::new(4);
        registry.add_watchpoint(0x1000, 0x11);
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.has_to_rollback());
    }
}
