use std::mem::size_of;

/// Just like C's offsetof.
///
/// The magic number 0x4000 is insignificant. We use it to avoid using NULL, since
/// NULL can cause compiler problems, especially in cases of multiple inheritance.
#[macro_export]
macro_rules! offsetof {
    ($name : ident . $($field: ident).*) => {
        unsafe {
            let uninit = std::mem::transmute::<_,*const $name>(0x4000usize);
            let fref = &(&*uninit).$($field).*;
            let faddr = fref as *const _ as usize;
            faddr - 0x4000
        }
    }
}

macro_rules! as_atomic {
    ($value: expr;$t: ident) => {
        unsafe { core::mem::transmute::<_, &'_ core::sync::atomic::$t>($value as *const _) }
    };
}

/// Rounds `value` up to the nearest multiple of `align`.
pub const fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    ((value + align - 1) / align) * align
}

pub mod alloc_context;
pub mod dac;
pub mod ee;
pub mod events;
pub mod handles;
pub mod heap;
pub mod mmap;
pub mod object;
pub mod segment;
pub mod volatile;
pub mod write_watch;

#[cfg(test)]
mod tests;

/// Configuration for heap construction.
pub struct Config {
    /// Reserved size of each small-object segment.
    pub segment_size: usize,
    /// Reserved size of each large-object segment.
    pub large_segment_size: usize,
    /// Bytes committed up front in a fresh segment.
    pub initial_commit: usize,
    /// Minimum region handed to an allocation context by the slow path.
    pub alloc_quantum: usize,
    /// Total sized-ref payload at which an ephemeral collection is escalated
    /// to a full one.
    pub sized_ref_full_gc_threshold: usize,
    /// Enables verbose diagnostic events.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: 32 * 1024 * 1024,
            large_segment_size: 64 * 1024 * 1024,
            initial_commit: 64 * 1024,
            alloc_quantum: 8 * 1024,
            sized_ref_full_gc_threshold: 16 * 1024 * 1024,
            verbose: false,
        }
    }
}

pub use alloc_context::GcAllocContext;
pub use ee::{DefaultExecutionEngine, GcToExecutionEngine, SuspendReason, WriteBarrierOp};
pub use handles::{HandleManager, HandleStore, HandleType, ObjectHandle};
pub use heap::{
    init_gc_heap, GcAllocFlags, GcCollectionMode, GcHeap, GcStatus, Heap, HeapKind,
};
pub use object::GcObject;

const _: () = {
    // The translated write-watch table indexes by raw address; both sides of
    // that arithmetic assume the OS page size below.
    assert!(write_watch::WRITE_WATCH_PAGE_SIZE == 4096);
    assert!(size_of::<usize>() == size_of::<*mut u8>());
};
