//! The object-handle subsystem: stable indirection slots ("roots") of
//! varying strength that the collector scans and updates.
//!
//! A handle is a pointer to a [`HandleSlot`] inside a 64 KiB-aligned table
//! segment; masking the handle address recovers the segment header, which
//! carries the owning bucket's table-map index. Ownership therefore stays
//! tree-shaped (map → bucket → table → segment → slot) with no back
//! pointers from slots.

pub mod manager;
pub mod map;
pub mod scan;
pub mod store;
pub mod table;

pub use manager::HandleManager;
pub use store::{HandleStore, HandleTableBucket};

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::object::GcObject;

/// Wire values shared with the diagnostic reader; never renumber.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HandleType {
    /// Severed at first unreachability; does not track resurrection.
    WeakShort = 0,
    /// Tracks its target through finalization and resurrection.
    WeakLong = 1,
    Strong = 2,
    /// Strong, and forbids relocation of the target.
    Pinned = 3,
    /// Runtime-mutable strength, carried in the slot's extra word.
    Variable = 4,
    /// Strong while the external count in the extra word is nonzero.
    RefCounted = 5,
    /// A (primary, secondary) pair; the secondary lives exactly as long as
    /// the primary but never extends its lifetime.
    Dependent = 6,
    /// Pinned, but relocatable across stores during unit teardown.
    AsyncPinned = 7,
    /// Strong, with a user-supplied size consulted by full-collection
    /// heuristics.
    SizedRef = 8,
    /// Short weak half of a cooperating pair; the extra word carries the
    /// out-of-process weak-reference info released on severing.
    WeakNativeCom = 9,
}

pub const HANDLE_TYPE_COUNT: usize = 10;

impl HandleType {
    pub fn from_u8(value: u8) -> Option<HandleType> {
        if value as usize >= HANDLE_TYPE_COUNT {
            return None;
        }
        Some(unsafe { core::mem::transmute(value) })
    }

    /// Keeps its target alive on its own (possibly conditionally).
    pub fn is_strong(self) -> bool {
        matches!(
            self,
            HandleType::Strong
                | HandleType::Pinned
                | HandleType::AsyncPinned
                | HandleType::SizedRef
        )
    }
}

// Dynamic strength tags for Variable handles. Deliberately disjoint from the
// wire values above so a raw extra word can never be confused with a type.
pub const VHT_WEAK_SHORT: usize = 0x0000_0100;
pub const VHT_WEAK_LONG: usize = 0x0000_0200;
pub const VHT_STRONG: usize = 0x0000_0300;
pub const VHT_PINNED: usize = 0x0000_0400;
pub const VHT_MASK: usize = 0x0000_0F00;

pub fn is_valid_vht(value: usize) -> bool {
    matches!(value, VHT_WEAK_SHORT | VHT_WEAK_LONG | VHT_STRONG | VHT_PINNED)
}

const FREE_SLOT: u32 = 0xFF;
const TYPE_MASK: u32 = 0xFF;
const AGE_SHIFT: u32 = 8;
const AGE_MASK: u32 = 0xFF00;

/// One table slot. `meta` packs the handle type (or `FREE_SLOT`) in the low
/// byte and the scan age in the next byte.
#[repr(C)]
pub struct HandleSlot {
    object: AtomicPtr<GcObject>,
    extra: AtomicUsize,
    meta: AtomicU32,
}

impl HandleSlot {
    #[inline(always)]
    pub fn object(&self) -> *mut GcObject {
        self.object.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_object(&self, object: *mut GcObject) {
        self.object.store(object, Ordering::Release);
    }

    #[inline(always)]
    pub fn cas_object(&self, new: *mut GcObject, comparand: *mut GcObject) -> *mut GcObject {
        match self
            .object
            .compare_exchange(comparand, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    #[inline(always)]
    pub fn extra(&self) -> usize {
        self.extra.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_extra(&self, extra: usize) {
        self.extra.store(extra, Ordering::Release);
    }

    #[inline(always)]
    pub fn cas_extra(&self, new: usize, comparand: usize) -> usize {
        match self
            .extra
            .compare_exchange(comparand, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    #[inline(always)]
    pub fn raw_type(&self) -> u32 {
        self.meta.load(Ordering::Acquire) & TYPE_MASK
    }

    pub fn handle_type(&self) -> Option<HandleType> {
        HandleType::from_u8(self.raw_type() as u8)
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.raw_type() == FREE_SLOT
    }

    pub fn age(&self) -> u8 {
        ((self.meta.load(Ordering::Relaxed) & AGE_MASK) >> AGE_SHIFT) as u8
    }

    pub fn set_age(&self, age: u8) {
        let mut meta = self.meta.load(Ordering::Relaxed);
        loop {
            let new = (meta & !AGE_MASK) | ((age as u32) << AGE_SHIFT);
            match self
                .meta
                .compare_exchange_weak(meta, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => meta = current,
            }
        }
    }

    pub(crate) fn activate(&self, ty: HandleType, object: *mut GcObject, extra: usize) {
        debug_assert!(self.is_free());
        self.extra.store(extra, Ordering::Relaxed);
        self.object.store(object, Ordering::Relaxed);
        // Publishing the type last makes the slot visible to scans fully
        // formed.
        self.meta.store(ty as u32, Ordering::Release);
    }

    pub(crate) fn deactivate(&self) {
        debug_assert!(!self.is_free());
        self.meta.store(FREE_SLOT, Ordering::Release);
        self.object.store(null_mut(), Ordering::Relaxed);
        self.extra.store(0, Ordering::Relaxed);
    }
}

/// An opaque, stable identifier for one slot. Null is the documented failure
/// value of every handle-creating operation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct ObjectHandle(*mut HandleSlot);

unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

impl ObjectHandle {
    pub const fn null() -> Self {
        ObjectHandle(null_mut())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub(crate) fn from_slot(slot: *mut HandleSlot) -> Self {
        ObjectHandle(slot)
    }

    #[inline(always)]
    pub(crate) fn slot(self) -> &'static HandleSlot {
        debug_assert!(!self.is_null());
        unsafe { &*self.0 }
    }

    pub(crate) fn raw(self) -> *mut HandleSlot {
        self.0
    }
}

/// Reads the handle's current target.
#[inline(always)]
pub fn object_from_handle(handle: ObjectHandle) -> *mut GcObject {
    handle.slot().object()
}

/// Plain store. Unordered with respect to a concurrent collector scan, so
/// only legal when the caller owns the handle exclusively or the runtime is
/// at a safe point; use [`interlocked_compare_exchange_object_in_handle`]
/// otherwise. Resets the slot's age so the next ephemeral scan sees the new
/// target.
#[inline(always)]
pub fn store_object_in_handle(handle: ObjectHandle, object: *mut GcObject) {
    let slot = handle.slot();
    slot.set_object(object);
    slot.set_age(0);
}

/// Returns true if the handle was null and now holds `object`.
pub fn store_object_in_handle_if_null(handle: ObjectHandle, object: *mut GcObject) -> bool {
    let slot = handle.slot();
    if slot.cas_object(object, null_mut()).is_null() {
        slot.set_age(0);
        true
    } else {
        false
    }
}

/// The only slot mutation that is safe concurrently with collector scanning.
/// Returns the previous target; the store happened iff it equals
/// `comparand`.
pub fn interlocked_compare_exchange_object_in_handle(
    handle: ObjectHandle,
    object: *mut GcObject,
    comparand: *mut GcObject,
) -> *mut GcObject {
    let slot = handle.slot();
    let old = slot.cas_object(object, comparand);
    if old == comparand {
        slot.set_age(0);
    }
    old
}

pub fn handle_fetch_type(handle: ObjectHandle) -> Option<HandleType> {
    handle.slot().handle_type()
}

pub fn get_handle_extra_info(handle: ObjectHandle) -> usize {
    handle.slot().extra()
}

pub fn set_handle_extra_info(handle: ObjectHandle, extra: usize) {
    handle.slot().set_extra(extra)
}

/// The secondary half of a dependent pair lives in the extra word.
pub fn set_dependent_handle_secondary(handle: ObjectHandle, secondary: *mut GcObject) {
    debug_assert_eq!(handle.slot().handle_type(), Some(HandleType::Dependent));
    handle.slot().set_extra(secondary as usize);
    handle.slot().set_age(0);
}

pub fn get_dependent_handle_secondary(handle: ObjectHandle) -> *mut GcObject {
    debug_assert_eq!(handle.slot().handle_type(), Some(HandleType::Dependent));
    handle.slot().extra() as *mut GcObject
}

pub fn get_variable_handle_type(handle: ObjectHandle) -> usize {
    debug_assert_eq!(handle.slot().handle_type(), Some(HandleType::Variable));
    handle.slot().extra() & VHT_MASK
}

/// Atomically changes a variable handle's effective strength.
pub fn update_variable_handle_type(handle: ObjectHandle, vht: usize) {
    debug_assert!(is_valid_vht(vht));
    debug_assert_eq!(handle.slot().handle_type(), Some(HandleType::Variable));
    handle.slot().set_extra(vht);
    handle.slot().set_age(0);
}

/// Compare-exchange on the strength tag; returns the previous tag.
pub fn compare_exchange_variable_handle_type(
    handle: ObjectHandle,
    vht: usize,
    comparand: usize,
) -> usize {
    debug_assert!(is_valid_vht(vht) && is_valid_vht(comparand));
    debug_assert_eq!(handle.slot().handle_type(), Some(HandleType::Variable));
    let old = handle.slot().cas_extra(vht, comparand);
    if old == comparand {
        handle.slot().set_age(0);
    }
    old
}
