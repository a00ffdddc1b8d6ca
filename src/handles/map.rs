use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::store::HandleStore;

pub const MAP_SEGMENT_CAPACITY: usize = 64;

/// One chunk of the growable bucket index. Chunks chain instead of
/// relocating, so a bucket's index never changes and readers resolve an
/// index without any lock.
#[repr(C)]
struct HandleMapSegment {
    stores: [AtomicPtr<HandleStore>; MAP_SEGMENT_CAPACITY],
    next: AtomicPtr<HandleMapSegment>,
}

fn map_segment_layout() -> Layout {
    Layout::new::<HandleMapSegment>()
}

/// The append-only, index-stable list of handle-store buckets. All growth
/// and publication happens under the handle manager's lock; lookup is
/// lock-free.
pub struct HandleTableMap {
    head: AtomicPtr<HandleMapSegment>,
}

impl HandleTableMap {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    fn alloc_segment() -> *mut HandleMapSegment {
        // Zeroed memory is a valid all-null segment.
        unsafe { alloc_zeroed(map_segment_layout()) as *mut HandleMapSegment }
    }

    /// Finds the index of the first unused entry, growing the chain by one
    /// segment if every entry is taken. Returns `None` when segment
    /// allocation fails; existing entries are untouched in that case.
    /// Caller must hold the manager lock.
    pub fn find_free_index(&self) -> Option<u32> {
        let mut base = 0u32;
        let mut segment = self.head.load(Ordering::Acquire);
        if segment.is_null() {
            let fresh = Self::alloc_segment();
            if fresh.is_null() {
                return None;
            }
            self.head.store(fresh, Ordering::Release);
            return Some(0);
        }
        loop {
            let seg = unsafe { &*segment };
            for i in 0..MAP_SEGMENT_CAPACITY {
                if seg.stores[i].load(Ordering::Acquire).is_null() {
                    return Some(base + i as u32);
                }
            }
            let next = seg.next.load(Ordering::Acquire);
            if next.is_null() {
                let fresh = Self::alloc_segment();
                if fresh.is_null() {
                    return None;
                }
                seg.next.store(fresh, Ordering::Release);
                return Some(base + MAP_SEGMENT_CAPACITY as u32);
            }
            base += MAP_SEGMENT_CAPACITY as u32;
            segment = next;
        }
    }

    fn entry(&self, index: u32) -> Option<&AtomicPtr<HandleStore>> {
        let mut remaining = index as usize;
        let mut segment = self.head.load(Ordering::Acquire);
        while !segment.is_null() {
            let seg = unsafe { &*segment };
            if remaining < MAP_SEGMENT_CAPACITY {
                return Some(&seg.stores[remaining]);
            }
            remaining -= MAP_SEGMENT_CAPACITY;
            segment = seg.next.load(Ordering::Acquire);
        }
        None
    }

    /// Publishes a fully built store at the index previously returned by
    /// [`HandleTableMap::find_free_index`]. Caller must hold the manager
    /// lock.
    pub fn publish(&self, index: u32, store: *mut HandleStore) {
        let entry = self
            .entry(index)
            .unwrap_or_else(|| unreachable!("publish past end of map"));
        debug_assert!(entry.load(Ordering::Relaxed).is_null());
        entry.store(store, Ordering::Release);
    }

    /// Clears the entry; the index may be handed out again, but never while
    /// any handle of the departing store is still reachable.
    pub fn remove(&self, index: u32) -> *mut HandleStore {
        match self.entry(index) {
            Some(entry) => entry.swap(null_mut(), Ordering::AcqRel),
            None => null_mut(),
        }
    }

    pub fn get(&self, index: u32) -> Option<&HandleStore> {
        let store = self.entry(index)?.load(Ordering::Acquire);
        if store.is_null() {
            None
        } else {
            Some(unsafe { &*store })
        }
    }

    /// Visits every registered store.
    pub fn for_each(&self, visit: &mut dyn FnMut(u32, &HandleStore)) {
        let mut base = 0u32;
        let mut segment = self.head.load(Ordering::Acquire);
        while !segment.is_null() {
            let seg = unsafe { &*segment };
            for i in 0..MAP_SEGMENT_CAPACITY {
                let store = seg.stores[i].load(Ordering::Acquire);
                if !store.is_null() {
                    visit(base + i as u32, unsafe { &*store });
                }
            }
            base += MAP_SEGMENT_CAPACITY as u32;
            segment = seg.next.load(Ordering::Acquire);
        }
    }

    /// Frees the chain itself. Stores must already have been destroyed.
    pub fn teardown(&self) {
        let mut segment = self.head.swap(null_mut(), Ordering::AcqRel);
        while !segment.is_null() {
            let next = unsafe { (*segment).next.load(Ordering::Relaxed) };
            unsafe {
                dealloc(segment as *mut u8, map_segment_layout());
            }
            segment = next;
        }
    }
}
