//! Allocator Front End
//!
//! The malloc/free surface that installs detection metadata around every
//! allocation. On `malloc`, an object header is written ahead of the user
//! pointer and guard bytes fill the tail slack. On `free`, the guards are
//! verified (a broken guard records a watchpoint and suppresses the free),
//! the header is checked for double and invalid frees, and the block is
//! poisoned and parked in the quarantine until the epoch commits.
//!
//! The committer-side sweeps live here as well: [`check_heap_overflow`]
//! verifies the guards of every live allocation, [`check_uaf`] verifies the
//! poison of every quarantined block.
//!
//! [`check_heap_overflow`]: MemoryManager::check_heap_overflow
//! [`check_uaf`]: MemoryManager::check_uaf

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RuntimeConfig;
use crate::fault::{self, FaultKind};
use crate::header::{ObjectHeader, HEADER_SIZE};
use crate::heap::{HeapError, ManagedHeap};
use crate::log;
use crate::quarantine::{CacheOutcome, FreeRecord, Quarantine};
use crate::sentinel::{
    self, SentinelTable, MEMALIGN_SENTINEL_WORD, WORD_SIZE,
};
use crate::watchpoint::WatchpointRegistry;

/// Smallest allocation actually served; smaller requests are padded up.
pub const MIN_ALLOC: usize = 16;

/// Error from the pre-syscall buffer screen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The buffer starts inside the managed heap but runs past its end.
    #[error("buffer {addr:#x}+{len} runs past the managed heap")]
    RangeEscapesHeap {
        /// Buffer start.
        addr: usize,
        /// Buffer length.
        len: usize,
    },
    /// The buffer overlaps guard bytes; writing it would corrupt them.
    #[error("buffer {addr:#x}+{len} overlaps allocation guard bytes")]
    GuardedRange {
        /// Buffer start.
        addr: usize,
        /// Buffer length.
        len: usize,
    },
}

/// Outcome of a `free` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The block entered the quarantine.
    Freed,
    /// The block entered the quarantine and filled it: the epoch must end.
    FreedQuarantineFull,
    /// The pointer was null or not managed by this heap; nothing happened.
    Ignored,
    /// A guard was found broken: a watchpoint was recorded and the block
    /// intentionally leaked so the replay sees the same layout.
    SuppressedOverflow,
    /// The quarantine was already full. The block is marked free and
    /// poisoned but not yet cached; the caller must end the epoch and then
    /// cache the record.
    Deferred(FreeRecord),
}

/// The allocator front end and its detection state.
pub struct MemoryManager {
    heap: ManagedHeap,
    sentinels: SentinelTable,
    quarantine: Quarantine,
    watchpoints: WatchpointRegistry,
    detect_overflow: bool,
    detect_uaf: bool,
    allocations: AtomicU64,
    frees: AtomicU64,
    suppressed_frees: AtomicU64,
}

impl MemoryManager {
    /// Build the front end per the configuration.
    pub fn new(config: &RuntimeConfig) -> Result<Self, HeapError> {
        let heap = ManagedHeap::new(config.heap_size)?;
        let sentinels = SentinelTable::new(heap.base(), heap.len());
        Ok(Self {
            heap,
            sentinels,
            quarantine: Quarantine::new(config.max_free_objects),
            watchpoints: WatchpointRegistry::new(config.watchpoint_capacity),
            detect_overflow: config.detect_overflow,
            detect_uaf: config.detect_uaf,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            suppressed_frees: AtomicU64::new(0),
        })
    }

    /// The managed heap.
    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    /// The guard-byte table.
    pub fn sentinels(&self) -> &SentinelTable {
        &self.sentinels
    }

    /// The quarantine.
    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    /// The watchpoint registry.
    pub fn watchpoints(&self) -> &WatchpointRegistry {
        &self.watchpoints
    }

    /// Allocations served so far.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Frees accepted so far.
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Frees suppressed because a guard was broken.
    pub fn suppressed_free_count(&self) -> u64 {
        self.suppressed_frees.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes from the managed heap. Returns null when the
    /// arena cannot serve the request.
    pub fn malloc(&self, heap_id: usize, size: usize) -> *mut u8 {
        let raw_request = HEADER_SIZE + size.max(MIN_ALLOC);
        let Some(raw) = self.heap.raw_malloc(heap_id, raw_request) else {
            log::entry(log::LogLevel::Warn, "allocation failed")
                .field_int("size", size as i64)
                .emit();
            return std::ptr::null_mut();
        };
        let block_size = self.heap.raw_block_size(raw) - HEADER_SIZE;

        // Safety: the raw block has room for the header plus block_size bytes.
        unsafe {
            ObjectHeader::initialize(raw.as_ptr() as *mut ObjectHeader, block_size, size);
            let user = raw.as_ptr().add(HEADER_SIZE);
            if self.detect_overflow && size < block_size {
                sentinel::install_tail(&self.sentinels, user, size, block_size);
            }
            self.allocations.fetch_add(1, Ordering::Relaxed);
            user
        }
    }

    /// Allocate `size` bytes aligned to `boundary`. Boundaries are rounded
    /// up to a power of two of at least two words, so the aligned pointer
    /// always has room for the recovery word and its guard in front of it.
    pub fn memalign(&self, heap_id: usize, boundary: usize, size: usize) -> *mut u8 {
        let boundary = boundary
            .next_power_of_two()
            .max(2 * WORD_SIZE);

        let raw_user = self.malloc(heap_id, boundary + size);
        if raw_user.is_null() {
            return std::ptr::null_mut();
        }

        let mut aligned = (raw_user as usize + boundary) & !(boundary - 1);
        if aligned == raw_user as usize {
            aligned += boundary;
        }
        debug_assert!(aligned - raw_user as usize >= 2 * WORD_SIZE);

        // Safety: aligned sits at least two words into the allocation, so
        // both pre-block words are inside the block.
        unsafe {
            self.sentinels
                .set_memalign_sentinel_at((aligned - WORD_SIZE) as *mut usize);
            ((aligned - 2 * WORD_SIZE) as *mut usize).write(raw_user as usize);
        }
        aligned as *mut u8
    }

    /// Recover the pointer `malloc` originally produced for `ptr`,
    /// unwinding a memalign adjustment when one is recorded. `retire`
    /// drops the pre-block guard record (free path).
    ///
    /// # Safety
    ///
    /// `ptr` must lie inside the managed heap.
    unsafe fn resolve_user_ptr(&self, ptr: *mut u8, retire: bool) -> *mut u8 {
        let prev = (ptr as usize - WORD_SIZE) as *const usize;
        if prev.read() == MEMALIGN_SENTINEL_WORD {
            let stash = (ptr as usize - 2 * WORD_SIZE) as *const usize;
            let original = stash.read() as *mut u8;
            if self.heap.in_range(original as usize) {
                if retire {
                    self.sentinels.clear_sentinel_at(prev as *const u8);
                }
                return original;
            }
        }
        ptr
    }

    /// Free a block. Pointers outside the managed heap (including null) are
    /// ignored. Guard corruption suppresses the free and records a
    /// watchpoint; double and invalid frees are fatal.
    pub fn free(&self, _heap_id: usize, ptr: *mut u8, thread_index: usize) -> FreeOutcome {
        if ptr.is_null() || !self.heap.in_range(ptr as usize) {
            return FreeOutcome::Ignored;
        }
        // No user pointer can sit inside the first header slot of the arena;
        // resolving one would read before the arena base.
        if (ptr as usize) < self.heap.base() + HEADER_SIZE {
            fault::fatal(
                FaultKind::InvalidFree,
                "free of pointer without allocation metadata",
                Some(ptr as usize),
            );
        }

        // Safety: the pointer is in the arena, so the pre-block words and the
        // header slot are readable arena bytes.
        unsafe {
            let user = self.resolve_user_ptr(ptr, true);

            // The block start must be one the heap is actually tracking; a
            // lucky magic match in recycled bytes is not an allocation.
            let raw = NonNull::new_unchecked((user as usize - HEADER_SIZE) as *mut u8);
            if self.heap.raw_block_size(raw) == 0 {
                fault::fatal(
                    FaultKind::InvalidFree,
                    "free of pointer that is not a live allocation",
                    Some(user as usize),
                );
            }

            let header = &mut *ObjectHeader::from_user_ptr(user);
            if !header.is_valid() {
                fault::fatal(
                    FaultKind::InvalidFree,
                    "free of pointer without allocation metadata",
                    Some(user as usize),
                );
            }

            // Guards of a quarantined block were retired by its first free;
            // skip straight to the double-free report.
            if self.detect_overflow && !header.is_free() {
                let verdict = sentinel::verify_and_clear_tail(
                    &self.sentinels,
                    user,
                    header.requested_size(),
                    header.block_size(),
                );
                if verdict.corrupted {
                    let observed = (verdict.corrupted_word as *const usize).read();
                    self.watchpoints
                        .add_watchpoint(verdict.corrupted_word, observed);
                    self.suppressed_frees.fetch_add(1, Ordering::Relaxed);
                    log::entry(log::LogLevel::Warn, "overflow detected at free, leaking block")
                        .field_addr("ptr", user as usize)
                        .field_addr("corrupted", verdict.corrupted_word)
                        .emit();
                    return FreeOutcome::SuppressedOverflow;
                }
            }

            if header.is_free() {
                fault::fatal(
                    FaultKind::DoubleFree,
                    "block freed twice",
                    Some(user as usize),
                );
            }

            header.set_free();
            if self.detect_uaf {
                Quarantine::poison_block(user, header.block_size());
            }

            let record = FreeRecord {
                ptr: user as usize,
                owning_thread_index: thread_index,
                size_at_free: header.block_size(),
            };
            match self.quarantine.cache_free_object(record) {
                CacheOutcome::Cached => {
                    self.frees.fetch_add(1, Ordering::Relaxed);
                    FreeOutcome::Freed
                }
                CacheOutcome::CachedNowFull => {
                    self.frees.fetch_add(1, Ordering::Relaxed);
                    FreeOutcome::FreedQuarantineFull
                }
                CacheOutcome::Rejected => FreeOutcome::Deferred(record),
            }
        }
    }

    /// Cache a record the quarantine rejected, after the epoch that drained
    /// it has ended.
    pub fn cache_deferred(&self, record: FreeRecord) {
        match self.quarantine.cache_free_object(record) {
            CacheOutcome::Rejected => fault::fatal(
                FaultKind::InvariantBreach,
                "quarantine full immediately after drain",
                Some(record.ptr),
            ),
            _ => {
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Requested size of an allocation, 0 for unmanaged pointers.
    pub fn get_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null()
            || !self.heap.in_range(ptr as usize)
            || (ptr as usize) < self.heap.base() + HEADER_SIZE
        {
            return 0;
        }
        // Safety: in-range pointers have readable pre-block bytes.
        unsafe {
            let user = self.resolve_user_ptr(ptr, false);
            let raw = NonNull::new_unchecked((user as usize - HEADER_SIZE) as *mut u8);
            if self.heap.raw_block_size(raw) == 0 {
                return 0;
            }
            let header = &*ObjectHeader::from_user_ptr(user);
            if header.is_valid() {
                header.requested_size()
            } else {
                0
            }
        }
    }

    /// Screen a buffer about to be written by a syscall: refuse ranges that
    /// overlap guard bytes or run off the end of the managed heap.
    pub fn check_syscall_buffer(&self, ptr: *const u8, len: usize) -> Result<(), AccessError> {
        let addr = ptr as usize;
        if len == 0 || !self.heap.in_range(addr) {
            return Ok(());
        }
        if !self.heap.in_range(addr + len - 1) {
            return Err(AccessError::RangeEscapesHeap { addr, len });
        }
        if self.sentinels.has_sentinels(addr, len) {
            log::entry(log::LogLevel::Warn, "syscall buffer overlaps guard bytes")
                .field_addr("addr", addr)
                .field_int("len", len as i64)
                .emit();
            return Err(AccessError::GuardedRange { addr, len });
        }
        Ok(())
    }

    /// Committer sweep: verify the tail guards of every live allocation,
    /// recording a watchpoint per corrupted site. Guards are left in place
    /// for allocations that survive into the next epoch.
    pub fn check_heap_overflow(&self) -> bool {
        if !self.detect_overflow {
            return false;
        }
        let mut has_overflow = false;
        for (offset, _block_total) in self.heap.live_blocks() {
            let raw = (self.heap.base() + offset) as *mut u8;
            // Safety: live block offsets point at header-initialized arena
            // bytes; the committer runs with all mutators parked.
            unsafe {
                let header = &*(raw as *const ObjectHeader);
                if !header.is_valid() {
                    let observed = (raw as *const usize).read();
                    self.watchpoints.add_watchpoint(raw as usize, observed);
                    has_overflow = true;
                    continue;
                }
                if header.is_free() {
                    continue;
                }
                let user = raw.add(HEADER_SIZE);
                let verdict = sentinel::verify_tail(
                    &self.sentinels,
                    user,
                    header.requested_size(),
                    header.block_size(),
                );
                if verdict.corrupted {
                    let observed = (verdict.corrupted_word as *const usize).read();
                    self.watchpoints
                        .add_watchpoint(verdict.corrupted_word, observed);
                    has_overflow = true;
                }
            }
        }
        has_overflow
    }

    /// Committer sweep: verify the poison of every quarantined block,
    /// recording a watchpoint per disturbed block.
    pub fn check_uaf(&self) -> bool {
        if !self.detect_uaf {
            return false;
        }
        // Safety: quarantined records point at freed arena blocks that stay
        // reserved until the drain.
        unsafe {
            self.quarantine.check_uaf(|addr, value| {
                self.watchpoints.add_watchpoint(addr, value);
            })
        }
    }

    /// Release every quarantined block back to the underlying heap.
    /// Committer-only, after the overflow and poison sweeps.
    pub fn drain_quarantine(&self) -> usize {
        let records = self.quarantine.take_all();
        let count = records.len();
        for record in records {
            let raw = (record.ptr - HEADER_SIZE) as *mut u8;
            // Safety: quarantine records hold user pointers produced by
            // malloc, so raw is a live block start.
            if let Some(raw) = NonNull::new(raw) {
                self.heap.raw_free(0, raw);
            }
        }
        count
    }
}
