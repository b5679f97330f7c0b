//! Property-based tests for the guard-byte codec and the allocator front end.
//!
//! Uses proptest to drive the sentinel encodings across every word residue
//! and to verify that single-byte tail corruption never goes unnoticed.

use proptest::prelude::*;
use rewind_runtime::header::HEADER_SIZE;
use rewind_runtime::heap::{class_for, CLASS_BLOCK_SIZES, MAX_BLOCK_SIZE};
use rewind_runtime::memory::{FreeOutcome, MemoryManager, MIN_ALLOC};
use rewind_runtime::RuntimeConfig;

fn manager() -> MemoryManager {
    let config = RuntimeConfig::builder()
        .heap_size(1 << 18)
        .max_free_objects(1024)
        .build();
    MemoryManager::new(&config).unwrap()
}

/// Usable block size the arena serves for a request of `size` bytes.
fn usable_block(size: usize) -> usize {
    let raw = HEADER_SIZE + size.max(MIN_ALLOC);
    CLASS_BLOCK_SIZES[class_for(raw).unwrap()] - HEADER_SIZE
}

proptest! {
    /// Writing exactly the requested extent never trips detection.
    #[test]
    fn within_bounds_write_is_clean(size in 0usize..=512) {
        let mm = manager();
        let p = mm.malloc(0, size);
        prop_assert!(!p.is_null());
        unsafe {
            std::ptr::write_bytes(p, 0xA5, size);
        }
        prop_assert!(!mm.check_heap_overflow());
        prop_assert_eq!(mm.free(0, p, 0), FreeOutcome::Freed);
        prop_assert!(!mm.watchpoints().has_to_rollback());
    }

    /// The requested size is reported back exactly.
    #[test]
    fn get_size_reports_request(size in 0usize..=512) {
        let mm = manager();
        let p = mm.malloc(0, size);
        prop_assert!(!p.is_null());
        prop_assert_eq!(mm.get_size(p), size);
    }

    /// Corrupting the first byte past the requested extent is always
    /// detected at free, whatever the word residue.
    #[test]
    fn first_tail_byte_corruption_is_detected(size in 0usize..=511) {
        // Exact-fit blocks carry no guard; there is no tail to corrupt.
        prop_assume!(usable_block(size) > size);
        let mm = manager();
        let p = mm.malloc(0, size);
        prop_assert!(!p.is_null());
        unsafe {
            let tail = p.add(size);
            tail.write(tail.read() ^ 0xFF);
        }
        prop_assert_eq!(mm.free(0, p, 0), FreeOutcome::SuppressedOverflow);
        prop_assert!(mm.watchpoints().has_to_rollback());
    }

    /// A commit sweep sees the same corruption the free path sees.
    #[test]
    fn commit_sweep_detects_tail_corruption(size in 1usize..=256) {
        prop_assume!(usable_block(size) > size);
        let mm = manager();
        let p = mm.malloc(0, size);
        prop_assert!(!p.is_null());
        unsafe {
            let tail = p.add(size);
            tail.write(tail.read() ^ 0xFF);
        }
        prop_assert!(mm.check_heap_overflow());
    }

    /// memalign honors any power-of-two boundary and frees cleanly.
    #[test]
    fn memalign_alignment_holds(exp in 3u32..=12, size in 0usize..=256) {
        let boundary = 1usize << exp;
        let mm = manager();
        let p = mm.memalign(0, boundary, size);
        prop_assert!(!p.is_null());
        prop_assert_eq!(p as usize % boundary, 0);
        unsafe {
            std::ptr::write_bytes(p, 0x3C, size);
        }
        prop_assert_eq!(mm.free(0, p, 0), FreeOutcome::Freed);
        prop_assert!(!mm.watchpoints().has_to_rollback());
    }

    /// Size classes cover every request up to the largest block, never
    /// shrink a request, and grow monotonically.
    #[test]
    fn size_classes_cover_and_grow(size in 1usize..=MAX_BLOCK_SIZE) {
        let class = class_for(size).unwrap();
        prop_assert!(CLASS_BLOCK_SIZES[class] >= size);
        if class > 0 {
            prop_assert!(CLASS_BLOCK_SIZES[class - 1] < size);
        }
    }
}

#[test]
fn oversized_request_has_no_class() {
    assert_eq!(class_for(MAX_BLOCK_SIZE + 1), None);
}
