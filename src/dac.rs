//! The layout exposed to the out-of-process diagnostic reader.
//!
//! Treat this as a serialization format, not an internal struct: fields are
//! append-only, a minor version bump means "trailing fields added", a major
//! bump means the reader must be updated. Readers tolerate unknown trailing
//! fields by construction.

use crate::handles::map::HandleTableMap;
use crate::heap::OomHistory;
use crate::segment::Generation;

pub const DAC_MAJOR_VERSION: u32 = 1;
pub const DAC_MINOR_VERSION: u32 = 0;

/// Read-only view of collector internals. Pointer fields stay valid for the
/// life of the heap that produced the snapshot.
#[repr(C)]
pub struct GcDacVars {
    pub major_version: u32,
    pub minor_version: u32,
    pub generation_table: *const Generation,
    pub total_generation_count: u32,
    pub max_generation: u32,
    pub lowest_address: *const u8,
    pub highest_address: *const u8,
    pub handle_table_map: *const HandleTableMap,
    pub finalize_queue_fill_pointers: *const usize,
    pub finalize_queue_fill_pointer_count: u32,
    pub heap_count: u32,
    pub oom_history: *const OomHistory,
    // New fields go here, with a minor version bump.
}

unsafe impl Send for GcDacVars {}
unsafe impl Sync for GcDacVars {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsetof;
    use std::mem::size_of;

    // The reader addresses fields by offset; any failure here is a major
    // version bump, not a test fix.
    #[test]
    fn dac_layout_is_frozen() {
        let word = size_of::<usize>();
        assert_eq!(offsetof!(GcDacVars.major_version), 0);
        assert_eq!(offsetof!(GcDacVars.minor_version), 4);
        assert_eq!(offsetof!(GcDacVars.generation_table), word);
        assert_eq!(offsetof!(GcDacVars.total_generation_count), 2 * word);
        assert_eq!(offsetof!(GcDacVars.max_generation), 2 * word + 4);
        assert_eq!(offsetof!(GcDacVars.lowest_address), 3 * word);
        assert_eq!(offsetof!(GcDacVars.highest_address), 4 * word);
        assert_eq!(offsetof!(GcDacVars.handle_table_map), 5 * word);
        assert_eq!(offsetof!(GcDacVars.finalize_queue_fill_pointers), 6 * word);
        assert_eq!(
            offsetof!(GcDacVars.finalize_queue_fill_pointer_count),
            7 * word
        );
        assert_eq!(offsetof!(GcDacVars.heap_count), 7 * word + 4);
        assert_eq!(offsetof!(GcDacVars.oom_history), 8 * word);
    }

    #[test]
    fn version_constants() {
        assert_eq!(DAC_MAJOR_VERSION, 1);
        assert_eq!(DAC_MINOR_VERSION, 0);
    }
}
