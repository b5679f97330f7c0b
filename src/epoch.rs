//! Epoch Controller
//!
//! Ties the pieces together: the [`Runtime`] owns the allocator front end,
//! the phase machine, the rendezvous barrier, the registered global regions
//! and the watchpoint assist, and drives the epoch cycle
//! `epoch_begin -> normal execution -> epoch_end -> (commit | rollback) ->
//! epoch_begin`.
//!
//! The committer for a boundary is the thread that called
//! [`epoch_end`](Runtime::epoch_end), whether directly, through quarantine
//! pressure, or through a requested end picked up at a
//! [`checkpoint`](Runtime::checkpoint). Every other registered thread parks
//! at the barrier inside its own `checkpoint` call until the committer
//! decides.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::RwLock;

use crate::config::{ConfigError, RuntimeConfig};
use crate::heap::HeapError;
use crate::log;
use crate::memory::{AccessError, FreeOutcome, MemoryManager};
use crate::phase::{EpochPhase, PhaseState};
use crate::rendezvous::Rendezvous;
use crate::snapshot::{BackupStore, GlobalRegions};
use crate::watchpoint::{LoggingAssist, WatchpointAssist};

/// Error constructing or initializing the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The heap arena could not be reserved.
    #[error(transparent)]
    Heap(#[from] HeapError),
    /// The process-wide runtime was already initialized.
    #[error("runtime already initialized")]
    AlreadyInitialized,
}

/// Registry assigning small stable indices to participating threads.
#[derive(Default)]
pub struct ThreadRegistry {
    indices: RwLock<HashMap<ThreadId, usize>>,
    next_index: AtomicUsize,
    active: AtomicUsize,
}

impl ThreadRegistry {
    fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread, returning its index. Idempotent.
    pub fn register(&self) -> usize {
        let id = std::thread::current().id();
        {
            let indices = self.indices.read();
            if let Some(&index) = indices.get(&id) {
                return index;
            }
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.indices.write().insert(id, index);
        self.active.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Remove the calling thread from the registry.
    pub fn unregister(&self) {
        let id = std::thread::current().id();
        if self.indices.write().remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Index of the calling thread, 0 if it never registered.
    pub fn current_index(&self) -> usize {
        self.indices
            .read()
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or(0)
    }

    /// Number of registered threads.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// A point-in-time summary of runtime activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Allocations served.
    pub allocations: u64,
    /// Frees accepted into the quarantine.
    pub frees: u64,
    /// Frees suppressed because a guard was broken.
    pub suppressed_frees: u64,
    /// Epochs committed.
    pub epochs_committed: u64,
    /// Epochs rolled back.
    pub epochs_rolled_back: u64,
    /// Epoch-end boundaries reached.
    pub epoch_ends: u64,
    /// Whether any rollback ever occurred.
    pub has_rolled_back: bool,
    /// Blocks currently quarantined.
    pub quarantined: usize,
    /// Watchpoints currently recorded.
    pub watchpoints: usize,
    /// Threads currently registered.
    pub registered_threads: usize,
}

/// The epoch runtime.
pub struct Runtime {
    memory: MemoryManager,
    phase: PhaseState,
    rendezvous: Rendezvous,
    globals: GlobalRegions,
    assist: Box<dyn WatchpointAssist>,
    threads: ThreadRegistry,
    epoch_end_requested: AtomicBool,
    epochs_committed: AtomicU64,
    epochs_rolled_back: AtomicU64,
}

impl Runtime {
    /// Build a runtime with the default (logging) watchpoint assist and
    /// begin the first epoch. The calling thread is registered.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_assist(config, Box::new(LoggingAssist::new()))
    }

    /// Build a runtime with a caller-supplied watchpoint assist.
    pub fn with_assist(
        config: RuntimeConfig,
        assist: Box<dyn WatchpointAssist>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        log::init_with_level(config.log_level);

        let install_handler = config.install_segv_handler;
        let runtime = Self {
            memory: MemoryManager::new(&config)?,
            phase: PhaseState::new(),
            rendezvous: Rendezvous::new(),
            globals: GlobalRegions::new(),
            assist,
            threads: ThreadRegistry::new(),
            epoch_end_requested: AtomicBool::new(false),
            epochs_committed: AtomicU64::new(0),
            epochs_rolled_back: AtomicU64::new(0),
        };
        runtime.threads.register();
        if install_handler {
            crate::signal::install_segv_handler();
        }
        runtime.epoch_begin();
        log::entry(log::LogLevel::Debug, "runtime initialized")
            .field_int("heap_size", runtime.memory.heap().len() as i64)
            .emit();
        Ok(runtime)
    }

    // ------------------------------------------------------------------
    // Allocation surface
    // ------------------------------------------------------------------

    /// Allocate `size` bytes. Null on exhaustion.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.memory.malloc(self.threads.current_index(), size)
    }

    /// Allocate zeroed memory for `count` elements of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            // Safety: malloc returned a block of at least `total` bytes.
            unsafe {
                std::ptr::write_bytes(ptr, 0, total);
            }
        }
        ptr
    }

    /// Resize an allocation with standard realloc semantics.
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return std::ptr::null_mut();
        }
        let old_size = self.memory.get_size(ptr);
        if old_size == 0 && !self.memory.heap().in_range(ptr as usize) {
            return std::ptr::null_mut();
        }
        let new_ptr = self.malloc(size);
        if new_ptr.is_null() {
            return std::ptr::null_mut();
        }
        // Safety: both blocks are at least `old_size.min(size)` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
        }
        self.free(ptr);
        new_ptr
    }

    /// Allocate `size` bytes aligned to `boundary`.
    pub fn memalign(&self, boundary: usize, size: usize) -> *mut u8 {
        self.memory
            .memalign(self.threads.current_index(), boundary, size)
    }

    /// Free an allocation. Quarantine pressure may end the epoch from here.
    pub fn free(&self, ptr: *mut u8) {
        let thread_index = self.threads.current_index();
        match self.memory.free(thread_index, ptr, thread_index) {
            FreeOutcome::FreedQuarantineFull => {
                log::debug("quarantine reached capacity, requesting epoch end");
                self.request_epoch_end();
            }
            FreeOutcome::Deferred(record) => {
                // The quarantine could not take the record; this thread
                // becomes the committer and caches it after the drain. A
                // rollback undoes the free along with everything else, so
                // the record is dropped in that case: the replay frees again.
                let rolled_back = self.epochs_rolled_back.load(Ordering::Relaxed);
                self.epoch_end();
                if self.epochs_rolled_back.load(Ordering::Relaxed) == rolled_back {
                    self.memory.cache_deferred(record);
                }
            }
            _ => {}
        }
    }

    /// Requested size of an allocation, 0 for unmanaged pointers.
    pub fn get_size(&self, ptr: *mut u8) -> usize {
        self.memory.get_size(ptr)
    }

    /// Screen a buffer about to be written by a syscall.
    pub fn check_syscall_buffer(&self, ptr: *const u8, len: usize) -> Result<(), AccessError> {
        self.memory.check_syscall_buffer(ptr, len)
    }

    // ------------------------------------------------------------------
    // Epoch surface
    // ------------------------------------------------------------------

    /// Snapshot heap metadata and refresh the heap and global backups. The
    /// first call moves the machine out of `Init`.
    pub fn epoch_begin(&self) {
        self.memory.heap().save_metadata();
        self.memory.heap().backup();
        self.globals.backup();
        let _guard = self.rendezvous.lock();
        if self.phase.is_init() {
            self.phase.transition(EpochPhase::NormalExecution);
        }
    }

    /// End the current epoch as the committer: wait for every other
    /// registered thread to park, sweep for corruption, then commit or roll
    /// back and release everyone into the next epoch.
    ///
    /// If another thread is already committing this boundary, the call parks
    /// as a mutator instead and returns once the boundary has passed.
    pub fn epoch_end(&self) {
        let total_mutators = self.threads.active().saturating_sub(1);
        if !self.rendezvous.arrive_as_committer(&self.phase, total_mutators) {
            return;
        }
        self.epoch_end_requested.store(false, Ordering::Release);

        if self.phase.is_rollback() {
            // A fault diverted this boundary already.
            return;
        }

        let mut must_rollback = self.memory.check_heap_overflow();
        if self.memory.check_uaf() {
            must_rollback = true;
        }
        if !must_rollback && self.memory.watchpoints().has_to_rollback() {
            must_rollback = true;
        }

        if must_rollback {
            self.rollback();
        } else {
            self.commit();
        }
    }

    /// Cooperative boundary check. Mutators call this between units of
    /// work: it parks when a boundary is open and turns the caller into the
    /// committer when an epoch end has been requested.
    pub fn checkpoint(&self) {
        if self.phase.is_epoch_end() {
            self.rendezvous.park(&self.phase);
            return;
        }
        if self.epoch_end_requested.swap(false, Ordering::AcqRel) {
            self.epoch_end();
        }
    }

    /// Ask for the epoch to end at the next checkpoint, without blocking.
    pub fn request_epoch_end(&self) {
        self.epoch_end_requested.store(true, Ordering::Release);
    }

    /// Commit path: drain the quarantine, retire watchpoints, re-snapshot,
    /// release. Runs with every mutator parked.
    fn commit(&self) {
        let drained = self.memory.drain_quarantine();
        self.memory.watchpoints().clear();
        self.memory.heap().save_metadata();
        self.memory.heap().backup();
        self.globals.backup();
        self.rendezvous.release(&self.phase);
        self.epochs_committed.fetch_add(1, Ordering::Relaxed);
        log::entry(log::LogLevel::Debug, "epoch committed")
            .field_int("epoch", self.phase.num_of_ends() as i64)
            .field_int("drained", drained as i64)
            .emit();
    }

    /// Rollback path: restore the epoch-begin image, arm watchpoints,
    /// release. Runs with every mutator parked. The quarantine empties
    /// without reclaiming anything, since the restored metadata has those
    /// blocks live again.
    fn rollback(&self) {
        self.rendezvous.mark_rollback(&self.phase);
        self.memory.quarantine().take_all();
        self.memory.heap().recover_metadata();
        self.globals.recover_memory();
        self.memory.heap().recover_memory();
        let armed = self
            .memory
            .watchpoints()
            .install_watchpoints(self.assist.as_ref());
        self.epochs_rolled_back.fetch_add(1, Ordering::Relaxed);
        log::entry(log::LogLevel::Warn, "epoch rolled back")
            .field_int("epoch", self.phase.num_of_ends() as i64)
            .field_int("watchpoints_armed", armed as i64)
            .emit();
        self.rendezvous.release(&self.phase);
    }

    /// Restore the epoch-begin image without arming watchpoints or touching
    /// the phase machine. For a supervisor that re-executes on its own
    /// terms, with all threads quiesced.
    pub fn rollback_only(&self) {
        self.memory.quarantine().take_all();
        self.memory.heap().recover_metadata();
        self.globals.recover_memory();
        self.memory.heap().recover_memory();
        log::warn("memory restored without watchpoints");
    }

    /// Signal-path rollback: restore memory, arm watchpoints, and wake any
    /// parked thread onto the restored image. Invoked from the rollback
    /// entry the SEGV handler redirects to, never from the handler itself.
    pub(crate) fn segv_rollback(&self) {
        self.memory.quarantine().take_all();
        self.memory.heap().recover_metadata();
        self.globals.recover_memory();
        self.memory.heap().recover_memory();
        let armed = self
            .memory
            .watchpoints()
            .install_watchpoints(self.assist.as_ref());
        self.epochs_rolled_back.fetch_add(1, Ordering::Relaxed);
        log::entry(log::LogLevel::Warn, "fault-driven rollback")
            .field_int("watchpoints_armed", armed as i64)
            .emit();
        self.rendezvous.broadcast_rollback(&self.phase);
        self.rendezvous.release(&self.phase);
    }

    // ------------------------------------------------------------------
    // Introspection and wiring
    // ------------------------------------------------------------------

    /// Register the calling thread as an epoch participant.
    pub fn register_thread(&self) -> usize {
        self.threads.register()
    }

    /// Remove the calling thread from the epoch participants.
    pub fn unregister_thread(&self) {
        self.threads.unregister();
    }

    /// Register a global data region for epoch checkpointing.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay valid for the runtime's lifetime and
    /// must only be mutated by registered threads between checkpoints.
    pub unsafe fn register_global_region(&self, base: *mut u8, len: usize) {
        self.globals.register(base, len);
        // Pick up the region's current contents as its epoch-begin state.
        self.globals.backup();
    }

    /// Current phase of the epoch machine.
    pub fn phase(&self) -> EpochPhase {
        self.phase.current()
    }

    /// Whether any rollback has occurred. Monotone.
    pub fn has_rolled_back(&self) -> bool {
        self.phase.has_rolled_back()
    }

    /// The allocator front end, for advanced callers and tests.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Point-in-time activity summary.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            allocations: self.memory.allocation_count(),
            frees: self.memory.free_count(),
            suppressed_frees: self.memory.suppressed_free_count(),
            epochs_committed: self.epochs_committed.load(Ordering::Relaxed),
            epochs_rolled_back: self.epochs_rolled_back.load(Ordering::Relaxed),
            epoch_ends: self.phase.num_of_ends(),
            has_rolled_back: self.phase.has_rolled_back(),
            quarantined: self.memory.quarantine().len(),
            watchpoints: self.memory.watchpoints().len(),
            registered_threads: self.threads.active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        let config = RuntimeConfig::builder()
            .heap_size(1 << 20)
            .max_free_objects(64)
            .build();
        Runtime::new(config).unwrap()
    }

    #[test]
    fn test_init_enters_normal_execution() {
        let rt = runtime();
        assert_eq!(rt.phase(), EpochPhase::NormalExecution);
        assert_eq!(rt.stats().registered_threads, 1);
    }

    #[test]
    fn test_clean_epoch_commits() {
        let rt = runtime();
        let p = rt.malloc(24);
        unsafe {
            std::ptr::write_bytes(p, 0x11, 24);
        }
        rt.free(p);
        rt.epoch_end();

        let stats = rt.stats();
        assert_eq!(stats.epochs_committed, 1);
        assert_eq!(stats.epochs_rolled_back, 0);
        assert!(!stats.has_rolled_back);
        assert_eq!(stats.quarantined, 0);
        assert_eq!(rt.phase(), EpochPhase::NormalExecution);
    }

    #[test]
    fn test_overflow_rolls_back() {
        let rt = runtime();
        let p = rt.malloc(24);
        unsafe {
            p.add(24).write(0xAB);
        }
        rt.epoch_end();

        let stats = rt.stats();
        assert_eq!(stats.epochs_rolled_back, 1);
        assert!(stats.has_rolled_back);
        assert_eq!(rt.phase(), EpochPhase::NormalExecution);
    }

    #[test]
    fn test_rollback_restores_global_region() {
        let rt = runtime();
        let mut global = vec![7u8; 64];
        unsafe {
            rt.register_global_region(global.as_mut_ptr(), global.len());
        }

        // Mutate the global, then corrupt the heap so the epoch rolls back.
        global.fill(9);
        let p = rt.malloc(24);
        unsafe {
            p.add(24).write(0xFF);
        }
        rt.epoch_end();

        assert!(rt.has_rolled_back());
        assert!(global.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_rollback_restores_heap_contents() {
        let rt = runtime();
        let keep = rt.malloc(32);
        unsafe {
            std::ptr::write_bytes(keep, 0xAA, 32);
        }
        rt.epoch_end();
        assert_eq!(rt.stats().epochs_committed, 1);

        // New epoch: scribble over the surviving block, allocate a fresh one
        // and overflow it.
        unsafe {
            std::ptr::write_bytes(keep, 0xBB, 32);
        }
        let doomed = rt.malloc(24);
        unsafe {
            doomed.add(24).write(0x01);
        }
        rt.epoch_end();

        assert_eq!(rt.stats().epochs_rolled_back, 1);
        for i in 0..32 {
            assert_eq!(unsafe { keep.add(i).read() }, 0xAA);
        }
        // The restored metadata predates the doomed allocation.
        assert_eq!(rt.get_size(doomed), 0);
    }

    #[test]
    fn test_watchpoints_cleared_on_next_commit() {
        let rt = runtime();
        let p = rt.malloc(24);
        unsafe {
            p.add(24).write(0x01);
        }
        rt.epoch_end();
        assert_eq!(rt.stats().epochs_rolled_back, 1);
        assert_eq!(rt.stats().watchpoints, 1);

        // The replayed epoch stays clean this time: commit clears them.
        rt.epoch_end();
        assert_eq!(rt.stats().epochs_committed, 1);
        assert_eq!(rt.stats().watchpoints, 0);
    }

    #[test]
    fn test_checkpoint_picks_up_requested_end() {
        let rt = runtime();
        rt.request_epoch_end();
        rt.checkpoint();
        assert_eq!(rt.stats().epoch_ends, 1);
        assert_eq!(rt.stats().epochs_committed, 1);
    }

    #[test]
    fn test_quarantine_pressure_ends_epoch() {
        let config = RuntimeConfig::builder()
            .heap_size(1 << 20)
            .max_free_objects(4)
            .build();
        let rt = Runtime::new(config).unwrap();

        for _ in 0..=4 {
            let p = rt.malloc(16);
            rt.free(p);
            rt.checkpoint();
        }
        let stats = rt.stats();
        assert!(stats.epoch_ends >= 1);
        assert_eq!(stats.frees, 5);
        // No record was lost to the full buffer.
        assert!(stats.quarantined < 4);
    }

    #[test]
    fn test_rollback_only_restores_without_arming() {
        let rt = runtime();
        let p = rt.malloc(32);
        unsafe {
            std::ptr::write_bytes(p, 0x11, 32);
        }
        rt.epoch_begin();
        unsafe {
            std::ptr::write_bytes(p, 0x22, 32);
        }
        rt.rollback_only();
        for i in 0..32 {
            assert_eq!(unsafe { p.add(i).read() }, 0x11);
        }
        // No phase movement, no watchpoints, no rollback recorded.
        assert_eq!(rt.phase(), EpochPhase::NormalExecution);
        assert!(!rt.has_rolled_back());
        assert_eq!(rt.stats().watchpoints, 0);
    }

    #[test]
    fn test_thread_registry_indices() {
        let registry = ThreadRegistry::new();
        let first = registry.register();
        assert_eq!(registry.register(), first);
        assert_eq!(registry.current_index(), first);
        assert_eq!(registry.active(), 1);

        std::thread::scope(|s| {
            s.spawn(|| {
                let second = registry.register();
                assert_ne!(second, first);
                assert_eq!(registry.active(), 2);
                registry.unregister();
            });
        });

        registry.unregister();
        assert_eq!(registry.active(), 0);
    }
}
