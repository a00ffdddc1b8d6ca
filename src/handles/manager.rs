use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::map::HandleTableMap;
use super::store::HandleStore;
use super::table::TableSegmentHeader;
use super::{HandleType, ObjectHandle};
use crate::events::{GcEventKeyword, GcEventLevel};
use crate::fire_event;
use crate::object::GcObject;

// Process-wide handle state. Initialize before first use, shutdown after
// last use; nothing here lazily initializes on a hot path.
static HANDLE_TABLE_MAP: HandleTableMap = HandleTableMap::new();
static MANAGER_LOCK: Mutex<()> = parking_lot::const_mutex(());
static GLOBAL_STORE: AtomicPtr<HandleStore> = AtomicPtr::new(null_mut());
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static TABLE_COUNT: AtomicUsize = AtomicUsize::new(1);
static NATIVE_WEAK_SEVER: AtomicUsize = AtomicUsize::new(0);

/// Process-wide entry points of the handle subsystem.
pub struct HandleManager;

impl HandleManager {
    /// Idempotent. `table_count` is the collector's degree of parallelism;
    /// every bucket gets that many tables. Returns false when the global
    /// store cannot be built, which is fatal to collector startup by
    /// contract (the caller reports it upward, it is not retried).
    pub fn initialize(table_count: usize) -> bool {
        let _guard = MANAGER_LOCK.lock();
        if INITIALIZED.load(Ordering::Relaxed) {
            return true;
        }
        TABLE_COUNT.store(table_count.max(1), Ordering::Relaxed);
        let index = match HANDLE_TABLE_MAP.find_free_index() {
            Some(index) => index,
            None => return false,
        };
        let store = Box::into_raw(Box::new(HandleStore::new(
            index,
            table_count.max(1),
        )));
        HANDLE_TABLE_MAP.publish(index, store);
        GLOBAL_STORE.store(store, Ordering::Release);
        INITIALIZED.store(true, Ordering::Release);
        fire_event!(
            GcEventKeyword::GC_HANDLE,
            GcEventLevel::Information,
            "handle manager initialized, {} tables per bucket",
            table_count.max(1)
        );
        true
    }

    pub fn is_initialized() -> bool {
        INITIALIZED.load(Ordering::Acquire)
    }

    /// Idempotent. Destroys every store, the global one last.
    pub fn shutdown() {
        let _guard = MANAGER_LOCK.lock();
        if !INITIALIZED.load(Ordering::Relaxed) {
            return;
        }
        let mut doomed: Vec<(u32, *mut HandleStore)> = Vec::new();
        HANDLE_TABLE_MAP.for_each(&mut |index, store| {
            doomed.push((index, store as *const HandleStore as *mut HandleStore));
        });
        for (index, store) in doomed {
            HANDLE_TABLE_MAP.remove(index);
            unsafe {
                drop(Box::from_raw(store));
            }
        }
        HANDLE_TABLE_MAP.teardown();
        GLOBAL_STORE.store(null_mut(), Ordering::Release);
        INITIALIZED.store(false, Ordering::Release);
    }

    /// Always succeeds after `initialize`.
    pub fn get_global_handle_store() -> &'static HandleStore {
        let store = GLOBAL_STORE.load(Ordering::Acquire);
        debug_assert!(!store.is_null(), "handle manager not initialized");
        unsafe { &*store }
    }

    /// Creates an additional store for an isolated sub-unit of the runtime.
    /// Returns `None` when the table map cannot grow; existing stores are
    /// unaffected.
    pub fn create_handle_store() -> Option<&'static HandleStore> {
        let _guard = MANAGER_LOCK.lock();
        if !INITIALIZED.load(Ordering::Relaxed) {
            return None;
        }
        let index = HANDLE_TABLE_MAP.find_free_index()?;
        let store = Box::into_raw(Box::new(HandleStore::new(
            index,
            TABLE_COUNT.load(Ordering::Relaxed),
        )));
        HANDLE_TABLE_MAP.publish(index, store);
        Some(unsafe { &*store })
    }

    /// Destroys a store and with it every handle inside. The global store
    /// is never destroyed this way.
    ///
    /// # Safety
    /// No handle belonging to the store may be used after this call, and the
    /// store must have been uprooted so no scan is concurrently walking it.
    pub unsafe fn destroy_handle_store(store: &'static HandleStore) {
        debug_assert!(store.is_uprooted());
        debug_assert!(!core::ptr::eq(store, Self::get_global_handle_store()));
        let _guard = MANAGER_LOCK.lock();
        let raw = HANDLE_TABLE_MAP.remove(store.index());
        if !raw.is_null() {
            drop(Box::from_raw(raw));
        }
    }

    /// Allocates a handle in the global store, load-balanced by the calling
    /// thread's affinity. Null handle on allocation failure; never panics.
    pub fn create_global_handle_of_type(object: *mut GcObject, ty: HandleType) -> ObjectHandle {
        Self::get_global_handle_store().create_handle_of_type(object, ty)
    }

    /// Creates a second handle of the same kind (and extra info) referencing
    /// the same object, in the same store as the original.
    pub fn create_duplicate_handle(handle: ObjectHandle) -> ObjectHandle {
        let slot = handle.slot();
        let ty = match slot.handle_type() {
            Some(ty) => ty,
            None => return ObjectHandle::null(),
        };
        let header = unsafe { &*TableSegmentHeader::of(handle.raw()) };
        match HANDLE_TABLE_MAP.get(header.bucket_index) {
            Some(store) => store
                .bucket()
                .table(header.table_index as usize)
                .alloc_handle(ty, slot.object(), slot.extra()),
            None => ObjectHandle::null(),
        }
    }

    pub fn destroy_handle_of_type(handle: ObjectHandle, ty: HandleType) {
        debug_assert_eq!(handle.slot().handle_type(), Some(ty));
        Self::destroy_handle_of_unknown_type(handle)
    }

    pub fn destroy_handle_of_unknown_type(handle: ObjectHandle) {
        if handle.is_null() {
            return;
        }
        let header = unsafe { &*TableSegmentHeader::of(handle.raw()) };
        if let Some(store) = HANDLE_TABLE_MAP.get(header.bucket_index) {
            store
                .bucket()
                .table(header.table_index as usize)
                .free_handle(handle.slot());
        }
    }

    /// Registers the callback invoked with a severed native-weak handle's
    /// extra word, so the interop layer can release the out-of-process
    /// reference.
    pub fn set_native_weak_sever_callback(callback: fn(usize)) {
        NATIVE_WEAK_SEVER.store(callback as usize, Ordering::Release);
    }

    pub(crate) fn native_weak_sever(extra: usize) {
        let raw = NATIVE_WEAK_SEVER.load(Ordering::Acquire);
        if raw != 0 {
            let callback: fn(usize) = unsafe { core::mem::transmute(raw) };
            callback(extra);
        }
    }

    /// Visits every store that still participates in root scanning.
    pub(crate) fn for_each_rooted_store(visit: &mut dyn FnMut(&HandleStore)) {
        HANDLE_TABLE_MAP.for_each(&mut |_, store| {
            if !store.is_uprooted() {
                visit(store);
            }
        });
    }

    pub(crate) fn map() -> &'static HandleTableMap {
        &HANDLE_TABLE_MAP
    }
}
