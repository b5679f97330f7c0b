//! Managed Heap Arena
//!
//! The reference heap backing the allocator front end: a single contiguous
//! arena carved into power-of-two blocks, with per-class free bins and a bump
//! tail. Every block reserves [`HEADER_SIZE`](crate::header::HEADER_SIZE)
//! bytes at its start for the object header; the remainder is the usable
//! block size the front end reports.
//!
//! The arena is what makes epochs cheap to checkpoint: metadata (bins, bump
//! cursor, live map) is saved and restored as a value, and the used prefix of
//! the arena is shadow-copied on backup. Blocks are word-granular and all
//! class sizes are multiples of the smallest class, so user pointers are
//! always word-aligned.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::header::HEADER_SIZE;

/// Number of block size classes.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Block sizes per class, header included (power of two from 32 bytes to 64KB).
pub const CLASS_BLOCK_SIZES: [usize; NUM_SIZE_CLASSES] = [
    32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// Largest raw block the arena serves.
pub const MAX_BLOCK_SIZE: usize = CLASS_BLOCK_SIZES[NUM_SIZE_CLASSES - 1];

/// Arena alignment (one page).
const ARENA_ALIGN: usize = 4096;

/// Get the class index whose block covers `raw_size` bytes, or `None` when
/// the request exceeds the largest class.
#[inline]
pub fn class_for(raw_size: usize) -> Option<usize> {
    CLASS_BLOCK_SIZES.iter().position(|&s| s >= raw_size)
}

/// Heap error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// The arena reservation failed.
    #[error("arena reservation of {0} bytes failed")]
    ArenaReservation(usize),
    /// The arena size is not usable.
    #[error("arena size {0} is too small")]
    ArenaTooSmall(usize),
}

/// Allocator metadata, saved and restored as a unit at epoch boundaries.
#[derive(Debug, Clone, Default)]
struct HeapMetadata {
    /// Per-class free bins holding block offsets.
    bins: Vec<Vec<usize>>,
    /// First never-used arena offset.
    bump: usize,
    /// Live raw blocks: offset to class index.
    live: HashMap<usize, u8>,
}

impl HeapMetadata {
    fn new() -> Self {
        Self {
            bins: (0..NUM_SIZE_CLASSES).map(|_| Vec::new()).collect(),
            bump: 0,
            live: HashMap::new(),
        }
    }
}

struct HeapState {
    current: HeapMetadata,
    saved: HeapMetadata,
    /// Shadow copy of the arena's used prefix, refreshed on `backup`.
    shadow: Vec<u8>,
    /// Per-heap-id allocation counters (diagnostics only; the arena is shared).
    per_heap_allocs: HashMap<usize, u64>,
}

/// The arena heap.
pub struct ManagedHeap {
    base: NonNull<u8>,
    len: usize,
    state: Mutex<HeapState>,
}

// Safety: all metadata is behind the state mutex; arena bytes are only
// touched by the owner of a live block or by the parked-world committer.
unsafe impl Send for ManagedHeap {}
unsafe impl Sync for ManagedHeap {}

impl ManagedHeap {
    /// Reserve an arena of `len` bytes.
    pub fn new(len: usize) -> Result<Self, HeapError> {
        if len < CLASS_BLOCK_SIZES[0] {
            return Err(HeapError::ArenaTooSmall(len));
        }
        let layout = Layout::from_size_align(len, ARENA_ALIGN)
            .map_err(|_| HeapError::ArenaReservation(len))?;
        // Safety: layout has nonzero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(HeapError::ArenaReservation(len))?;
        Ok(Self {
            base,
            len,
            state: Mutex::new(HeapState {
                current: HeapMetadata::new(),
                saved: HeapMetadata::new(),
                shadow: Vec::new(),
                per_heap_allocs: HashMap::new(),
            }),
        })
    }

    /// Arena base address.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Arena length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no bytes (never true for a constructed heap).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` falls inside the arena.
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len
    }

    /// Allocate a raw block of at least `size` bytes. Returns the block
    /// start (where the header will live).
    pub fn raw_malloc(&self, heap_id: usize, size: usize) -> Option<NonNull<u8>> {
        let class = class_for(size)?;
        let block = CLASS_BLOCK_SIZES[class];

        let mut state = self.state.lock();
        let offset = if let Some(offset) = state.current.bins[class].pop() {
            offset
        } else {
            let offset = state.current.bump;
            if offset + block > self.len {
                return None;
            }
            state.current.bump = offset + block;
            offset
        };
        state.current.live.insert(offset, class as u8);
        *state.per_heap_allocs.entry(heap_id).or_insert(0) += 1;

        // Safety: offset + block <= len, so the pointer is in the arena.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Return a raw block to its free bin. `ptr` must be a block start
    /// previously handed out by [`raw_malloc`](Self::raw_malloc).
    pub fn raw_free(&self, _heap_id: usize, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.base();
        let mut state = self.state.lock();
        match state.current.live.remove(&offset) {
            Some(class) => state.current.bins[class as usize].push(offset),
            None => {
                debug_assert!(false, "raw_free of unknown block offset {offset:#x}");
            }
        }
    }

    /// Total bytes of the raw block containing `ptr` (a block start).
    /// Returns 0 for unknown pointers.
    pub fn raw_block_size(&self, ptr: NonNull<u8>) -> usize {
        let offset = ptr.as_ptr() as usize - self.base();
        let state = self.state.lock();
        state
            .current
            .live
            .get(&offset)
            .map(|&class| CLASS_BLOCK_SIZES[class as usize])
            .unwrap_or(0)
    }

    /// Usable bytes (header excluded) of the block class serving `size` raw
    /// bytes, or `None` if no class covers it.
    pub fn usable_size_for(&self, raw_size: usize) -> Option<usize> {
        class_for(raw_size).map(|class| CLASS_BLOCK_SIZES[class] - HEADER_SIZE)
    }

    /// Snapshot of live raw blocks as `(arena offset, block bytes)`, sorted
    /// by offset. Committer-only.
    pub fn live_blocks(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        let mut blocks: Vec<(usize, usize)> = state
            .current
            .live
            .iter()
            .map(|(&offset, &class)| (offset, CLASS_BLOCK_SIZES[class as usize]))
            .collect();
        blocks.sort_unstable();
        blocks
    }

    /// Number of live raw blocks.
    pub fn live_count(&self) -> usize {
        self.state.lock().current.live.len()
    }

    /// Save the allocator metadata for the epoch now beginning.
    pub fn save_metadata(&self) {
        let mut state = self.state.lock();
        state.saved = state.current.clone();
    }

    /// Restore the allocator metadata saved at epoch begin.
    pub fn recover_metadata(&self) {
        let mut state = self.state.lock();
        state.current = state.saved.clone();
    }

    /// Shadow-copy the used prefix of the arena.
    pub fn backup(&self) {
        let mut state = self.state.lock();
        let used = state.current.bump;
        state.shadow.resize(used, 0);
        // Safety: [base, base + used) is inside the arena; the committer runs
        // this with every mutator parked.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr(), state.shadow.as_mut_ptr(), used);
        }
    }

    /// Restore arena bytes from the shadow copy. Call after
    /// [`recover_metadata`](Self::recover_metadata) so the bump cursor and
    /// the shadow length agree.
    pub fn recover_memory(&self) {
        let state = self.state.lock();
        // Safety: shadow.len() never exceeds the arena length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                state.shadow.as_ptr(),
                self.base.as_ptr(),
                state.shadow.len(),
            );
        }
    }

    /// Allocations served per heap id.
    pub fn per_heap_allocations(&self) -> HashMap<usize, u64> {
        self.state.lock().per_heap_allocs.clone()
    }
}

impl Drop for ManagedHeap {
    fn drop(&mut self) {
        // Safety: base/len/align are exactly what `new` allocated.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, ARENA_ALIGN);
            alloc::dealloc(self.base.as_ptr(), layout);
        }
    }
}
