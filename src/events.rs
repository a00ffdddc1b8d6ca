//! Diagnostic event gating. Keyword and level values are a stable wire
//! contract with external tracing consumers; check [`is_enabled`] before
//! formatting any payload.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    pub struct GcEventKeyword: u64 {
        const GC = 0x1;
        const GC_HANDLE = 0x2;
        const HEAP_DUMP = 0x10_0000;
        const SAMPLED_OBJECT_ALLOCATION_HIGH = 0x20_0000;
        const HEAP_SURVIVAL_AND_MOVEMENT = 0x40_0000;
        const HEAP_COLLECT = 0x80_0000;
        const HEAP_AND_TYPE_NAMES = 0x100_0000;
        const SAMPLED_OBJECT_ALLOCATION_LOW = 0x200_0000;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum GcEventLevel {
    None = 0,
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Information = 4,
    Verbose = 5,
    LogAlways = 255,
}

static ENABLED_KEYWORDS: AtomicU64 = AtomicU64::new(0);
static ENABLED_LEVEL: AtomicU8 = AtomicU8::new(0);

/// Called by the host when the tracing session configuration changes.
pub fn configure(keywords: GcEventKeyword, level: GcEventLevel) {
    ENABLED_KEYWORDS.store(keywords.bits(), Ordering::Relaxed);
    ENABLED_LEVEL.store(level as u8, Ordering::Release);
}

/// Cheap enough to sit in front of every event site; `LogAlways` events pass
/// whenever their keyword does.
#[inline(always)]
pub fn is_enabled(keyword: GcEventKeyword, level: GcEventLevel) -> bool {
    if ENABLED_KEYWORDS.load(Ordering::Relaxed) & keyword.bits() == 0 {
        return false;
    }
    level == GcEventLevel::LogAlways || level as u8 <= ENABLED_LEVEL.load(Ordering::Acquire)
}

/// Emits a diagnostic event if its keyword/level gate is open. The payload
/// expression is not evaluated when gated off.
#[macro_export]
macro_rules! fire_event {
    ($keyword: expr, $level: expr, $($t:tt)*) => {
        if $crate::events::is_enabled($keyword, $level) {
            #[cfg(feature = "gc_logging")]
            tracing::info!(target: "ember_gc", $($t)*);
            #[cfg(not(feature = "gc_logging"))]
            { let _ = format_args!($($t)*); }
        }
    };
}
