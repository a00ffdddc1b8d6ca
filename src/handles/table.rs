use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{HandleSlot, HandleType, ObjectHandle};
use crate::object::GcObject;

/// Table segments are this size and this aligned, so a handle's segment
/// header is `handle & !(TABLE_SEGMENT_SIZE - 1)`.
pub const TABLE_SEGMENT_SIZE: usize = 64 * 1024;
const SEGMENT_HEADER_SIZE: usize = 16;
pub const SLOTS_PER_SEGMENT: usize = (TABLE_SEGMENT_SIZE - SEGMENT_HEADER_SIZE) / size_of::<HandleSlot>();

/// Lives at the front of every segment; locates the owning table without a
/// pointer, via the bucket's stable table-map index.
#[repr(C)]
pub struct TableSegmentHeader {
    pub bucket_index: u32,
    pub table_index: u32,
    pub slot_count: u32,
    _pad: u32,
}

impl TableSegmentHeader {
    /// Recovers the segment header for a handle by address masking.
    #[inline(always)]
    pub fn of(slot: *mut HandleSlot) -> *mut TableSegmentHeader {
        (slot as usize & !(TABLE_SEGMENT_SIZE - 1)) as *mut TableSegmentHeader
    }

    pub fn slots(&self) -> *mut HandleSlot {
        (self as *const Self as usize + SEGMENT_HEADER_SIZE) as *mut HandleSlot
    }

    pub fn contains(&self, slot: *const HandleSlot) -> bool {
        let first = self.slots() as usize;
        let addr = slot as usize;
        addr >= first
            && addr < first + self.slot_count as usize * size_of::<HandleSlot>()
            && (addr - first) % size_of::<HandleSlot>() == 0
    }
}

fn segment_layout() -> Layout {
    // Size == alignment; see TableSegmentHeader::of.
    Layout::from_size_align(TABLE_SEGMENT_SIZE, TABLE_SEGMENT_SIZE).unwrap()
}

/// A fixed-type-per-slot container scanned by the collector. Slot memory is
/// append-only: segments are never freed while the table lives, so handle
/// addresses stay stable.
pub struct HandleTable {
    bucket_index: u32,
    table_index: u32,
    segments: Mutex<Vec<NonNull<TableSegmentHeader>>>,
    free: Mutex<Vec<NonNull<HandleSlot>>>,
    handle_count: AtomicUsize,
}

unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

impl HandleTable {
    pub fn new(bucket_index: u32, table_index: u32) -> Self {
        Self {
            bucket_index,
            table_index,
            segments: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            handle_count: AtomicUsize::new(0),
        }
    }

    pub fn table_index(&self) -> u32 {
        self.table_index
    }

    pub fn handle_count(&self) -> usize {
        self.handle_count.load(Ordering::Relaxed)
    }

    /// Allocates and activates one slot. Returns a null handle when the
    /// process is out of memory; never panics.
    pub fn alloc_handle(&self, ty: HandleType, object: *mut GcObject, extra: usize) -> ObjectHandle {
        let slot = {
            let mut free = self.free.lock();
            if free.is_empty() && !self.grow(&mut free) {
                return ObjectHandle::null();
            }
            match free.pop() {
                Some(slot) => slot,
                None => return ObjectHandle::null(),
            }
        };
        unsafe {
            slot.as_ref().activate(ty, object, extra);
        }
        self.handle_count.fetch_add(1, Ordering::Relaxed);
        ObjectHandle::from_slot(slot.as_ptr())
    }

    /// Releases a slot back to the table. Double-destroy is a caller-contract
    /// violation; `deactivate` asserts in debug builds.
    pub fn free_handle(&self, slot: &HandleSlot) {
        slot.deactivate();
        self.handle_count.fetch_sub(1, Ordering::Relaxed);
        self.free
            .lock()
            .push(unsafe { NonNull::new_unchecked(slot as *const _ as *mut HandleSlot) });
    }

    fn grow(&self, free: &mut Vec<NonNull<HandleSlot>>) -> bool {
        if free.try_reserve(SLOTS_PER_SEGMENT).is_err() {
            return false;
        }
        let raw = unsafe { alloc_zeroed(segment_layout()) };
        let header = match NonNull::new(raw as *mut TableSegmentHeader) {
            Some(header) => header,
            None => return false,
        };
        unsafe {
            let h = &mut *header.as_ptr();
            h.bucket_index = self.bucket_index;
            h.table_index = self.table_index;
            h.slot_count = SLOTS_PER_SEGMENT as u32;
            let slots = h.slots();
            for i in 0..SLOTS_PER_SEGMENT {
                let slot = slots.add(i);
                // Zeroed meta would read as handle type 0; stamp every slot
                // free before it can be observed.
                (*slot).meta.store(super::FREE_SLOT, Ordering::Relaxed);
                free.push(NonNull::new_unchecked(slot));
            }
        }
        self.segments.lock().push(header);
        true
    }

    /// Visits every active slot. The collector calls this with mutators
    /// suspended; concurrent use is limited to read-only diagnostics that
    /// tolerate tearing.
    pub fn for_each_slot(&self, visit: &mut dyn FnMut(&HandleSlot)) {
        let segments = self.segments.lock();
        for header in segments.iter() {
            unsafe {
                let h = header.as_ref();
                let slots = h.slots();
                for i in 0..h.slot_count as usize {
                    let slot = &*slots.add(i);
                    if !slot.is_free() {
                        visit(slot);
                    }
                }
            }
        }
    }

    /// True when `slot` points into one of this table's segments.
    pub fn contains_slot(&self, slot: *const HandleSlot) -> bool {
        let header = TableSegmentHeader::of(slot as *mut HandleSlot);
        let segments = self.segments.lock();
        segments.iter().any(|s| s.as_ptr() == header)
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        let segments = self.segments.get_mut();
        for header in segments.drain(..) {
            unsafe {
                dealloc(header.as_ptr() as *mut u8, segment_layout());
            }
        }
    }
}
