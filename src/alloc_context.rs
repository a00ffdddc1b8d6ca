use std::ptr::null_mut;

use crate::object::GcObject;

/// Per-mutator-thread bump-pointer allocation state.
///
/// This layout is shared with JIT-generated allocation fast paths and with
/// the out-of-process diagnostic reader. Field order and sizes are a binary
/// compatibility contract; do not reorder or resize fields.
#[repr(C)]
pub struct GcAllocContext {
    /// Next free byte in the currently owned region.
    pub alloc_ptr: *mut u8,
    /// One past the last usable byte of the region. `alloc_ptr <= alloc_limit`
    /// holds at all times.
    pub alloc_limit: *mut u8,
    /// Total small-object bytes handed out through this context.
    pub alloc_bytes: i64,
    /// Total large-object (and other user-old-heap) bytes attributed to the
    /// owning thread.
    pub alloc_bytes_uoh: i64,
    /// Reserved for the collector; opaque to the mutator.
    pub gc_reserved_1: *mut GcObject,
    /// Reserved for the collector; opaque to the mutator.
    pub gc_reserved_2: *mut GcObject,
    /// Number of allocations serviced since the context was last replenished.
    pub alloc_count: i32,
}

// The context is exclusively owned by its thread; the raw pointers never
// escape it unless the host externally synchronizes.
unsafe impl Send for GcAllocContext {}

impl GcAllocContext {
    pub const fn new() -> Self {
        Self {
            alloc_ptr: null_mut(),
            alloc_limit: null_mut(),
            alloc_bytes: 0,
            alloc_bytes_uoh: 0,
            gc_reserved_1: null_mut(),
            gc_reserved_2: null_mut(),
            alloc_count: 0,
        }
    }

    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Lock-free fast path: bumps the cursor, or returns null when the
    /// region cannot satisfy `size` and the caller must take the slow path.
    /// `size` must already be granule-aligned.
    #[inline(always)]
    pub fn fast_alloc(&mut self, size: usize) -> *mut u8 {
        debug_assert!(self.alloc_ptr <= self.alloc_limit);
        let result = self.alloc_ptr;
        if result.is_null() || (self.alloc_limit as usize - result as usize) < size {
            return null_mut();
        }
        unsafe {
            self.alloc_ptr = result.add(size);
        }
        self.alloc_bytes += size as i64;
        self.alloc_count += 1;
        result
    }

    /// Hands the context a fresh region carved out by the slow path.
    pub fn replenish(&mut self, start: *mut u8, limit: *mut u8) {
        debug_assert!(start <= limit);
        self.alloc_ptr = start;
        self.alloc_limit = limit;
        self.alloc_count = 0;
    }

    pub fn remaining(&self) -> usize {
        self.alloc_limit as usize - self.alloc_ptr as usize
    }

    /// Drops the owned region. The collector calls this while mutators are
    /// suspended, after planting a free gap over the unused tail.
    pub fn reset_region(&mut self) {
        self.alloc_ptr = null_mut();
        self.alloc_limit = null_mut();
    }
}
