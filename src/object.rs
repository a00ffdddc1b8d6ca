use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

/// An opaque managed object, as seen by the collector. The hosting runtime
/// owns the layout behind this pointer; the collector only ever inspects the
/// [`ObjectHeader`] that precedes it.
#[repr(C)]
pub struct GcObject {
    _private: [u8; 0],
}

pub const ALLOCATION_GRANULARITY: usize = size_of::<usize>();

// ObjectHeader is prepended to every allocation.
//
// +---------------+------+-------------------------------------------+
// | name          | bits |                                           |
// +---------------+------+-------------------------------------------+
// | padding       |   32 | Only present on 64-bit platforms.         |
// +---------------+------+-------------------------------------------+
// | size          |   26 | In granules, so up to 512 MiB per object. |
// | mark bit      |    1 | Set atomically; survives until sweep.     |
// | pinned        |    1 | Set when allocated from a pinned request. |
// | finalize      |    1 | Object is registered for finalization.    |
// | contains refs |    1 | Object has interior references.           |
// | free          |    1 | A dead gap reclaimed by sweep.            |
// | unused        |    1 |                                           |
// +---------------+------+-------------------------------------------+
#[repr(C)]
pub struct ObjectHeader {
    #[cfg(target_pointer_width = "64")]
    _padding: u32,
    encoded: EncodedWord,
}

#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
pub struct EncodedWord {
    size: B26,
    marked: bool,
    pinned: bool,
    finalize: bool,
    contains_refs: bool,
    free: bool,
    #[allow(dead_code)]
    unused: B1,
}

const MARK_BIT: u32 = 1 << 26;
const PIN_BIT: u32 = 1 << 27;

impl ObjectHeader {
    pub fn new(size: usize) -> Self {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        let mut encoded = EncodedWord::new();
        encoded.set_size((size / ALLOCATION_GRANULARITY) as u32);
        Self {
            #[cfg(target_pointer_width = "64")]
            _padding: 0,
            encoded,
        }
    }

    /// The object this header precedes.
    #[inline(always)]
    pub fn object(&self) -> *mut GcObject {
        (self as *const Self as usize + size_of::<Self>()) as *mut GcObject
    }

    #[inline(always)]
    pub fn from_object(object: *mut GcObject) -> *mut ObjectHeader {
        (object as usize - size_of::<Self>()) as *mut ObjectHeader
    }

    #[inline(always)]
    fn word(&self) -> &AtomicU32 {
        as_atomic!(&self.encoded; AtomicU32)
    }

    /// Total allocation size including the header, in bytes.
    #[inline(always)]
    pub fn get_size(&self) -> usize {
        (self.word().load(Ordering::Relaxed) & (MARK_BIT - 1)) as usize * ALLOCATION_GRANULARITY
    }

    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        self.encoded.set_size((size / ALLOCATION_GRANULARITY) as u32);
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.word().load(Ordering::Relaxed) & MARK_BIT != 0
    }

    /// Returns true if this call marked the object, false if it already was.
    /// Safe to race from parallel markers.
    #[inline(always)]
    pub fn set_marked(&self) -> bool {
        self.word().fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    #[inline(always)]
    pub fn clear_marked(&self) {
        self.word().fetch_and(!MARK_BIT, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.word().load(Ordering::Relaxed) & PIN_BIT != 0
    }

    pub fn set_pinned(&self, pinned: bool) {
        if pinned {
            self.word().fetch_or(PIN_BIT, Ordering::AcqRel);
        } else {
            self.word().fetch_and(!PIN_BIT, Ordering::AcqRel);
        }
    }

    pub fn is_finalizable(&self) -> bool {
        self.encoded_snapshot().finalize()
    }

    pub fn set_finalizable(&mut self) {
        self.encoded.set_finalize(true);
    }

    pub fn contains_refs(&self) -> bool {
        self.encoded_snapshot().contains_refs()
    }

    pub fn set_contains_refs(&mut self) {
        self.encoded.set_contains_refs(true);
    }

    pub fn is_free(&self) -> bool {
        self.encoded_snapshot().free()
    }

    /// Turns this header into a free gap of `size` bytes so heap walks can
    /// step over reclaimed memory.
    pub fn make_free(&mut self, size: usize) {
        let mut encoded = EncodedWord::new();
        encoded.set_size((size / ALLOCATION_GRANULARITY) as u32);
        encoded.set_free(true);
        self.encoded = encoded;
    }

    #[inline(always)]
    fn encoded_snapshot(&self) -> EncodedWord {
        unsafe { core::mem::transmute(self.word().load(Ordering::Relaxed)) }
    }
}
