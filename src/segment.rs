use std::ptr::null_mut;

use crate::alloc_context::GcAllocContext;
use crate::mmap::Mmap;
use crate::object::ObjectHeader;

pub const SEGMENT_FLAG_NONE: u32 = 0;
/// Read-only pseudo-segment registered by the host; never compacted or freed.
pub const SEGMENT_FLAG_READONLY: u32 = 0x1;

/// Space kept clear at the front of every segment so that a segment pointer
/// is never also a valid object pointer.
pub const SEGMENT_FIRST_OBJECT_OFFSET: usize = 64;

/// A reserved/committed/allocated range of heap memory.
///
/// `mem_start <= allocated <= committed <= reserved_end` always holds;
/// `allocated` starts past the first-object offset.
pub struct HeapSegment {
    mem: Mmap,
    mem_start: *mut u8,
    reserved_end: *mut u8,
    pub committed: *mut u8,
    pub allocated: *mut u8,
    pub flags: u32,
    pub next: *mut HeapSegment,
}

unsafe impl Send for HeapSegment {}

impl HeapSegment {
    /// Reserves a new segment and commits its first chunk. Returns `None`
    /// when the OS refuses the reservation or the initial commit.
    pub fn reserve(reserve_size: usize, initial_commit: usize) -> Option<Box<HeapSegment>> {
        debug_assert!(initial_commit >= SEGMENT_FIRST_OBJECT_OFFSET);
        let mem = Mmap::reserve(reserve_size);
        if !mem.is_reserved() {
            return None;
        }
        let start = mem.start();
        if !mem.commit(start, initial_commit) {
            return None;
        }
        let end = mem.end();
        Some(Box::new(HeapSegment {
            mem,
            mem_start: start,
            reserved_end: end,
            committed: unsafe { start.add(initial_commit) },
            allocated: unsafe { start.add(SEGMENT_FIRST_OBJECT_OFFSET) },
            flags: SEGMENT_FLAG_NONE,
            next: null_mut(),
        }))
    }

    /// Wraps a host-provided read-only range as a frozen pseudo-segment. The
    /// memory is owned by the host, not by the collector.
    pub fn frozen(start: *mut u8, allocated: *mut u8, reserved_end: *mut u8) -> Box<HeapSegment> {
        Box::new(HeapSegment {
            mem: Mmap::uninit(),
            mem_start: start,
            reserved_end,
            committed: reserved_end,
            allocated,
            flags: SEGMENT_FLAG_READONLY,
            next: null_mut(),
        })
    }

    pub fn start(&self) -> *mut u8 {
        self.mem_start
    }

    pub fn reserved_end(&self) -> *mut u8 {
        self.reserved_end
    }

    /// Where the first object in this segment lives.
    pub fn first_object(&self) -> *mut u8 {
        unsafe { self.mem_start.add(SEGMENT_FIRST_OBJECT_OFFSET) }
    }

    pub fn is_readonly(&self) -> bool {
        self.flags & SEGMENT_FLAG_READONLY != 0
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.mem_start as *const u8 && addr < self.allocated as *const u8
    }

    pub fn committed_remaining(&self) -> usize {
        self.committed as usize - self.allocated as usize
    }

    /// Grows the committed range by at least `grow` bytes, page-rounded.
    /// Failure leaves the segment untouched.
    pub fn grow_commit(&mut self, grow: usize) -> bool {
        let grow = crate::align_usize(grow, crate::write_watch::WRITE_WATCH_PAGE_SIZE);
        let new_committed = self.committed as usize + grow;
        if new_committed > self.reserved_end as usize {
            return false;
        }
        if !self.mem.commit(self.committed, grow) {
            return false;
        }
        self.committed = new_committed as *mut u8;
        debug_assert!(self.allocated <= self.committed && self.committed <= self.reserved_end);
        true
    }

    pub fn check_invariants(&self) {
        debug_assert!(self.mem_start <= self.allocated);
        debug_assert!(self.allocated <= self.committed);
        debug_assert!(self.committed <= self.reserved_end);
    }
}

/// One entry of the generation table. The leading fields are part of the
/// diagnostic-reader layout; keep `allocation_context` and `start_segment`
/// first.
#[repr(C)]
pub struct Generation {
    pub allocation_context: GcAllocContext,
    pub start_segment: *mut HeapSegment,
    pub allocation_segment: *mut HeapSegment,
    pub gen_num: u32,
    pub allocation_size: usize,
}

unsafe impl Send for Generation {}

impl Generation {
    pub const fn new(gen_num: u32) -> Self {
        Self {
            allocation_context: GcAllocContext::new(),
            start_segment: null_mut(),
            allocation_segment: null_mut(),
            gen_num,
            allocation_size: 0,
        }
    }
}

/// Walks every object in `[start, end)`, free gaps included.
///
/// # Safety
/// The range must be a well-formed run of headers, which is only guaranteed
/// while mutators are suspended and allocation contexts have been fixed.
pub unsafe fn walk_object_range(
    start: *mut u8,
    end: *mut u8,
    walk: &mut dyn FnMut(*mut ObjectHeader, usize) -> bool,
) {
    let mut cursor = start;
    while cursor < end {
        let header = cursor as *mut ObjectHeader;
        let size = (*header).get_size();
        // A zero size is the unallocated frontier of a region still owned by
        // a live allocation context.
        if size == 0 {
            break;
        }
        debug_assert!(size >= core::mem::size_of::<ObjectHeader>());
        if !walk(header, size) {
            break;
        }
        cursor = cursor.add(size);
    }
}
