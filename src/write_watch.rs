//! Software write-watch: a page-granularity dirty table consulted by the
//! background collector on hosts without hardware write tracking.
//!
//! Mutator-side dirty marking is barrier-free for speed; the scan side pays
//! for that with explicit process-wide write-buffer flushes (see
//! [`get_dirty`]). A byte is either clean (0) or dirty (0xFF) and racing
//! writers storing the same value is benign.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::volatile::flush_process_write_buffers;

pub const WRITE_WATCH_PAGE_SIZE: usize = 4096;
const PAGE_SHIFT: usize = 12;
const DIRTY: u8 = 0xFF;

struct WriteWatchState {
    /// The raw table as allocated, before translation.
    untranslated: AtomicPtr<u8>,
    /// `untranslated - table_byte_index(lowest)`, so lookups index by raw
    /// address with no subtraction.
    translated: AtomicUsize,
    lowest: AtomicUsize,
    highest: AtomicUsize,
    enabled: AtomicBool,
}

// Process-wide singleton; bound once by `initialize_untranslated_table` and
// torn down by `static_close`. No lazy init anywhere on the marking path.
static STATE: WriteWatchState = WriteWatchState {
    untranslated: AtomicPtr::new(std::ptr::null_mut()),
    translated: AtomicUsize::new(0),
    lowest: AtomicUsize::new(0),
    highest: AtomicUsize::new(0),
    enabled: AtomicBool::new(false),
};

#[inline(always)]
pub fn table_byte_index(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// Bytes of table needed to span `[lowest, highest)`.
pub fn table_size_for_range(lowest: usize, highest: usize) -> usize {
    debug_assert!(lowest < highest);
    table_byte_index(highest - 1) + 1 - table_byte_index(lowest)
}

/// One-time binding of a freshly allocated table to the current heap bounds.
/// The caller owns the table memory and keeps it alive until `static_close`
/// or the next resize.
pub fn initialize_untranslated_table(table: *mut u8, lowest: usize, highest: usize) {
    debug_assert!(STATE.untranslated.load(Ordering::Relaxed).is_null());
    debug_assert!(!is_enabled_for_gc_heap());
    STATE.untranslated.store(table, Ordering::Relaxed);
    STATE
        .translated
        .store(table as usize - table_byte_index(lowest), Ordering::Relaxed);
    STATE.lowest.store(lowest, Ordering::Relaxed);
    STATE.highest.store(highest, Ordering::Release);
}

/// Rebinds the table after the heap's address range grew, carrying dirty
/// state over into the corresponding region of the larger table. Requires
/// mutators suspended (or page-write synchronization held by the caller);
/// returns the old table for the caller to free.
pub fn set_resized_untranslated_table(
    new_table: *mut u8,
    new_lowest: usize,
    new_highest: usize,
) -> *mut u8 {
    let old_table = STATE.untranslated.load(Ordering::Relaxed);
    let old_lowest = STATE.lowest.load(Ordering::Relaxed);
    let old_highest = STATE.highest.load(Ordering::Relaxed);
    debug_assert!(!new_table.is_null());
    debug_assert!(new_lowest <= old_lowest && old_highest <= new_highest);

    if !old_table.is_null() {
        let old_len = table_size_for_range(old_lowest, old_highest);
        let dst_offset = table_byte_index(old_lowest) - table_byte_index(new_lowest);
        unsafe {
            core::ptr::copy_nonoverlapping(old_table, new_table.add(dst_offset), old_len);
        }
    }

    STATE.untranslated.store(new_table, Ordering::Relaxed);
    STATE.translated.store(
        new_table as usize - table_byte_index(new_lowest),
        Ordering::Relaxed,
    );
    STATE.lowest.store(new_lowest, Ordering::Relaxed);
    STATE.highest.store(new_highest, Ordering::Release);
    old_table
}

/// Both toggles require the execution engine suspended: write-barrier code in
/// flight on other threads must not straddle the switch.
pub fn enable_for_gc_heap() {
    debug_assert!(!STATE.untranslated.load(Ordering::Relaxed).is_null());
    debug_assert!(!is_enabled_for_gc_heap());
    STATE.enabled.store(true, Ordering::Release);
}

pub fn disable_for_gc_heap() {
    debug_assert!(is_enabled_for_gc_heap());
    STATE.enabled.store(false, Ordering::Release);
}

#[inline(always)]
pub fn is_enabled_for_gc_heap() -> bool {
    STATE.enabled.load(Ordering::Acquire)
}

/// Unbinds the table so the process can shut the collector down. Returns the
/// table pointer for the owner to free.
pub fn static_close() -> *mut u8 {
    STATE.enabled.store(false, Ordering::Relaxed);
    let table = STATE.untranslated.swap(std::ptr::null_mut(), Ordering::Relaxed);
    STATE.translated.store(0, Ordering::Relaxed);
    STATE.lowest.store(0, Ordering::Relaxed);
    STATE.highest.store(0, Ordering::Release);
    table
}

#[inline(always)]
fn byte_for(addr: usize) -> *mut u8 {
    let index = table_byte_index(addr);
    // Index 0 would mean a null-ish address; the table is never legitimately
    // indexed there.
    debug_assert!(index != 0);
    (STATE.translated.load(Ordering::Relaxed) + index) as *mut u8
}

#[inline(always)]
fn in_tracked_range(addr: usize) -> bool {
    addr >= STATE.lowest.load(Ordering::Relaxed) && addr < STATE.highest.load(Ordering::Relaxed)
}

/// Marks the page containing `addr` dirty for a write of at most pointer
/// size. No barrier: a `get_dirty` scan flushes write buffers before it
/// trusts the table.
#[inline(always)]
pub fn set_dirty(addr: usize, write_size: usize) {
    debug_assert!(write_size <= core::mem::size_of::<usize>());
    debug_assert!(in_tracked_range(addr));
    debug_assert!(table_byte_index(addr) == table_byte_index(addr + write_size - 1));
    let byte = byte_for(addr);
    unsafe {
        // Skipping the store when already dirty keeps the page clean in the
        // cache for the overwhelmingly common already-dirty case.
        if byte.read_volatile() == 0 {
            byte.write_volatile(DIRTY);
        }
    }
}

/// Marks every page overlapping `[base, base + size)` dirty. Used for whole
/// freshly-materialized regions, so this always stores.
pub fn set_dirty_region(base: usize, size: usize) {
    debug_assert!(size > 0);
    debug_assert!(in_tracked_range(base) && in_tracked_range(base + size - 1));
    let first = byte_for(base);
    let count = table_byte_index(base + size - 1) - table_byte_index(base) + 1;
    unsafe {
        core::ptr::write_bytes(first, DIRTY, count);
    }
}

/// Clears every page overlapping `[base, base + size)`.
pub fn clear_dirty(base: usize, size: usize) {
    debug_assert!(size > 0);
    debug_assert!(in_tracked_range(base) && in_tracked_range(base + size - 1));
    let first = byte_for(base);
    let count = table_byte_index(base + size - 1) - table_byte_index(base) + 1;
    unsafe {
        core::ptr::write_bytes(first, 0, count);
    }
}

/// Scans `[base, base + size)` for dirty pages, writing each dirty page's
/// base address into `pages`. Returns the number written; a return value
/// equal to `pages.len()` signals that more dirty pages may remain.
///
/// With `clear` set, dirty bytes found are zeroed in the same pass. When the
/// runtime is not suspended, write buffers are flushed before the scan (so
/// barrier-free marking is visible) and again after clearing (so a mutator
/// re-dirtying a page is guaranteed to observe the clear before the caller
/// relies on its absence).
pub fn get_dirty(
    base: usize,
    size: usize,
    pages: &mut [*mut u8],
    clear: bool,
    is_runtime_suspended: bool,
) -> usize {
    debug_assert!(size > 0);
    debug_assert!(in_tracked_range(base) && in_tracked_range(base + size - 1));
    if pages.is_empty() {
        return 0;
    }

    if !is_runtime_suspended {
        flush_process_write_buffers();
    }

    let mut count = 0usize;
    let mut cleared_any = false;
    let first_index = table_byte_index(base);
    let last_index = table_byte_index(base + size - 1);
    let translated = STATE.translated.load(Ordering::Relaxed);

    for index in first_index..=last_index {
        let byte = (translated + index) as *mut u8;
        unsafe {
            if byte.read_volatile() != 0 {
                if clear {
                    byte.write_volatile(0);
                    cleared_any = true;
                }
                pages[count] = (index << PAGE_SHIFT) as *mut u8;
                count += 1;
                if count == pages.len() {
                    break;
                }
            }
        }
    }

    if !is_runtime_suspended && cleared_any {
        flush_process_write_buffers();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_sizing() {
        assert_eq!(table_size_for_range(0x10000, 0x11000), 1);
        assert_eq!(table_size_for_range(0x10000, 0x11001), 2);
        assert_eq!(
            table_size_for_range(0x10000, 0x10000 + 200 * WRITE_WATCH_PAGE_SIZE),
            200
        );
    }

    #[test]
    fn byte_index_is_page_granular() {
        assert_eq!(table_byte_index(0x1000), 1);
        assert_eq!(table_byte_index(0x1FFF), 1);
        assert_eq!(table_byte_index(0x2000), 2);
    }
}
