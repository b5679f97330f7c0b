//! Object Headers
//!
//! A fixed-size metadata record sits immediately before every pointer the
//! allocator hands out. It carries the usable block size, the caller's
//! requested size, a free flag, and a magic word whose absence signals that
//! the metadata itself was overwritten.

/// Magic value identifying a well-formed header.
#[cfg(target_pointer_width = "64")]
pub const HEADER_MAGIC: usize = 0xFEED_FACE_FEED_FACE;
/// Magic value identifying a well-formed header.
#[cfg(target_pointer_width = "32")]
pub const HEADER_MAGIC: usize = 0xFEED_FACE;

/// Per-allocation metadata placed directly before the user pointer.
#[repr(C)]
pub struct ObjectHeader {
    magic: usize,
    block_size: usize,
    requested_size: usize,
    free_flag: usize,
}

/// Size of the header record in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    /// Write a fresh header at `ptr` for a block with `block_size` usable
    /// bytes, of which `requested` were asked for.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `HEADER_SIZE` bytes and word-aligned.
    pub unsafe fn initialize(ptr: *mut ObjectHeader, block_size: usize, requested: usize) {
        ptr.write(ObjectHeader {
            magic: HEADER_MAGIC,
            block_size,
            requested_size: requested,
            free_flag: 0,
        });
    }

    /// Recover the header for a user pointer.
    ///
    /// # Safety
    ///
    /// `user` must be a pointer previously returned by the allocator (or at
    /// least point `HEADER_SIZE` bytes past readable memory); the result is
    /// only meaningful if a header was written there.
    pub unsafe fn from_user_ptr(user: *mut u8) -> *mut ObjectHeader {
        (user as *mut ObjectHeader).sub(1)
    }

    /// Usable bytes in the block, header excluded.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes the caller asked for.
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// Update the requested size (realloc bookkeeping).
    pub fn set_requested_size(&mut self, requested: usize) {
        self.requested_size = requested;
    }

    /// Whether the block has been freed.
    pub fn is_free(&self) -> bool {
        self.free_flag != 0
    }

    /// Mark the block freed.
    pub fn set_free(&mut self) {
        self.free_flag = 1;
    }

    /// Mark the block live again (reuse out of the underlying heap).
    pub fn clear_free(&mut self) {
        self.free_flag = 0;
    }

    /// Whether the header's magic is intact. A failed check means the
    /// metadata was overwritten or the pointer never came from this
    /// allocator.
    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC
    }
}
