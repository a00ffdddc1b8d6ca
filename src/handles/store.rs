use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::table::HandleTable;
use super::{HandleSlot, HandleType, ObjectHandle};
use crate::object::GcObject;

/// A set of handle tables, one per parallel heap, load-balancing handle
/// traffic across heaps. Exactly one bucket constitutes one logical store.
pub struct HandleTableBucket {
    tables: Box<[CachePadded<HandleTable>]>,
    index: u32,
}

impl HandleTableBucket {
    pub fn new(index: u32, table_count: usize) -> Self {
        debug_assert!(table_count > 0);
        let tables = (0..table_count)
            .map(|i| CachePadded::new(HandleTable::new(index, i as u32)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { tables, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn table(&self, heap_affinity: usize) -> &HandleTable {
        &self.tables[heap_affinity % self.tables.len()]
    }

    pub fn for_each_slot(&self, visit: &mut dyn FnMut(&HandleSlot)) {
        for table in self.tables.iter() {
            table.for_each_slot(visit);
        }
    }
}

static NEXT_THREAD_AFFINITY: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_AFFINITY: usize = NEXT_THREAD_AFFINITY.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_affinity() -> usize {
    THREAD_AFFINITY.with(|a| *a)
}

/// The unit of bulk handle lifecycle; owns one bucket. Destroying a store
/// destroys every handle in it.
pub struct HandleStore {
    bucket: HandleTableBucket,
    uprooted: AtomicBool,
}

impl HandleStore {
    pub(crate) fn new(index: u32, table_count: usize) -> Self {
        Self {
            bucket: HandleTableBucket::new(index, table_count),
            uprooted: AtomicBool::new(false),
        }
    }

    pub fn bucket(&self) -> &HandleTableBucket {
        &self.bucket
    }

    pub fn index(&self) -> u32 {
        self.bucket.index()
    }

    /// Allocates a handle in the table picked by the calling thread's
    /// affinity. Returns a null handle on allocation failure.
    pub fn create_handle_of_type(&self, object: *mut GcObject, ty: HandleType) -> ObjectHandle {
        self.create_handle_of_type_with_affinity(object, ty, current_thread_affinity())
    }

    /// As above, but the caller pins the receiving table; the collector uses
    /// this to preserve heap locality when relocating handles.
    pub fn create_handle_of_type_with_affinity(
        &self,
        object: *mut GcObject,
        ty: HandleType,
        heap_affinity: usize,
    ) -> ObjectHandle {
        debug_assert!(ty != HandleType::Variable && ty != HandleType::Dependent);
        self.bucket.table(heap_affinity).alloc_handle(ty, object, 0)
    }

    pub fn create_handle_with_extra_info(
        &self,
        object: *mut GcObject,
        ty: HandleType,
        extra: usize,
    ) -> ObjectHandle {
        debug_assert!(ty != HandleType::Variable || super::is_valid_vht(extra));
        self.bucket
            .table(current_thread_affinity())
            .alloc_handle(ty, object, extra)
    }

    pub fn create_dependent_handle(
        &self,
        primary: *mut GcObject,
        secondary: *mut GcObject,
    ) -> ObjectHandle {
        self.bucket.table(current_thread_affinity()).alloc_handle(
            HandleType::Dependent,
            primary,
            secondary as usize,
        )
    }

    /// Membership test: recover the slot's segment header by masking and
    /// check its bucket index, then confirm against the owning table's
    /// segment list. Always safe, even concurrently with scanning.
    pub fn contains_handle(&self, handle: ObjectHandle) -> bool {
        if handle.is_null() {
            return false;
        }
        let header = unsafe { &*super::table::TableSegmentHeader::of(handle.raw()) };
        if header.bucket_index != self.bucket.index()
            || !header.contains(handle.raw())
            || header.table_index as usize >= self.bucket.table_count()
        {
            return false;
        }
        // The segment could belong to a table freed and coincidentally
        // reallocated under another store; confirm against this bucket's own
        // segment list.
        let table = self.bucket.table(header.table_index as usize);
        table.contains_slot(handle.raw()) && !handle.slot().is_free()
    }

    /// Marks the whole store as no longer a root source. Called immediately
    /// before the store is destroyed; scans started after this never visit
    /// these handles again.
    pub fn uproot(&self) {
        self.uprooted.store(true, Ordering::Release);
    }

    pub fn is_uprooted(&self) -> bool {
        self.uprooted.load(Ordering::Acquire)
    }

    pub fn handle_count(&self) -> usize {
        (0..self.bucket.table_count())
            .map(|i| self.bucket.table(i).handle_count())
            .sum()
    }

    /// For each live async-pinned handle: give the host a chance to observe
    /// a completed operation (`clear_if_complete` returning true drops the
    /// handle), otherwise re-create the handle in `target` on the same
    /// parallel table and hand it back through `set_handle`. Either way the
    /// handle in this store is destroyed.
    pub fn relocate_async_pinned_handles(
        &self,
        target: &HandleStore,
        clear_if_complete: &mut dyn FnMut(*mut GcObject) -> bool,
        set_handle: &mut dyn FnMut(*mut GcObject, ObjectHandle),
    ) {
        for i in 0..self.bucket.table_count() {
            let table = self.bucket.table(i);
            let mut doomed: Vec<*mut HandleSlot> = Vec::new();
            table.for_each_slot(&mut |slot| {
                if slot.handle_type() != Some(HandleType::AsyncPinned) {
                    return;
                }
                let object = slot.object();
                doomed.push(slot as *const _ as *mut HandleSlot);
                if object.is_null() || clear_if_complete(object) {
                    return;
                }
                let relocated =
                    target.create_handle_of_type_with_affinity(object, HandleType::AsyncPinned, i);
                if !relocated.is_null() {
                    set_handle(object, relocated);
                }
            });
            for slot in doomed {
                table.free_handle(unsafe { &*slot });
            }
        }
    }
}
