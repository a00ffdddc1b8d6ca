//! The collector side of the heap/execution-engine contract: allocation,
//! collection triggering, no-GC regions, background-collection coordination
//! and the diagnostic walk family.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use atomic::Atomic;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::alloc_context::GcAllocContext;
use crate::dac::{GcDacVars, DAC_MAJOR_VERSION, DAC_MINOR_VERSION};
use crate::ee::{
    GcToExecutionEngine, SuspendReason, WriteBarrierOp, WriteBarrierParameters,
};
use crate::events::{GcEventKeyword, GcEventLevel};
use crate::fire_event;
use crate::handles::{scan, HandleManager, ObjectHandle};
use crate::mmap::Mmap;
use crate::object::{GcObject, ObjectHeader, ALLOCATION_GRANULARITY};
use crate::segment::{Generation, HeapSegment};
use crate::write_watch;
use crate::{align_usize, Config};

pub const MAX_GENERATION: u32 = 2;
pub const LARGE_OBJECT_GENERATION: u32 = 3;
pub const TOTAL_GENERATION_COUNT: usize = 4;

/// Objects at or above this size go to the large-object heap.
pub const LARGE_OBJECT_SIZE: usize = 85_000;

bitflags! {
    /// Allocation flags; values shared with the execution engine.
    pub struct GcAllocFlags: u32 {
        const NO_FLAGS = 0;
        const FINALIZE = 0x1;
        const CONTAINS_REF = 0x2;
        const ALIGN8_BIAS = 0x4;
        const ALIGN8 = 0x8;
        const ZEROING_OPTIONAL = 0x10;
        const LARGE_OBJECT_HEAP = 0x20;
    }
}

bitflags! {
    pub struct GcCollectionMode: u32 {
        const DEFAULT = 0;
        const NON_BLOCKING = 0x1;
        const BLOCKING = 0x2;
        const OPTIMIZED = 0x4;
        const COMPACTING = 0x8;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcStatus {
    Succeeded,
    Failed,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StartNoGcRegionStatus {
    Succeeded,
    NotEnoughMemory,
    AmountTooLarge,
    AlreadyInProgress,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EndNoGcRegionStatus {
    Succeeded,
    NotInProgress,
    GcInduced,
    AllocExceeded,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcWaitStatus {
    Signaled,
    Timeout,
    Failed,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcPhase {
    Idle,
    Preparing,
    Marking,
    Planning,
    Relocating,
    Sweeping,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum OomReason {
    None = 0,
    Budget = 1,
    CantCommit = 2,
    CantReserve = 3,
    LargeObjectHeap = 4,
    LowMemory = 5,
    UnproductiveFullGc = 6,
}

/// Structured record of the most recent allocation failure; part of the
/// diagnostic-reader surface.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct OomHistory {
    pub reason: OomReason,
    pub alloc_size: usize,
    pub available_commit: usize,
    pub gc_index: u64,
    pub is_large_object_heap: bool,
}

impl OomHistory {
    const fn none() -> Self {
        Self {
            reason: OomReason::None,
            alloc_size: 0,
            available_commit: 0,
            gc_index: 0,
            is_large_object_heap: false,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FrozenSegmentInfo {
    pub base: *mut u8,
    /// Bytes of live, immutable objects starting at `base`.
    pub allocated_size: usize,
    /// Total reserved size of the range.
    pub reserved_size: usize,
}

/// Token returned by frozen-segment registration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FrozenSegmentHandle(*mut HeapSegment);

unsafe impl Send for FrozenSegmentHandle {}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapKind {
    /// One parallel heap; a blocking collection runs on the triggering
    /// mutator thread.
    Workstation,
    /// `heap_count` parallel heaps; handle buckets get one table per heap.
    Server { heap_count: usize },
}

impl HeapKind {
    pub fn heap_count(self) -> usize {
        match self {
            HeapKind::Workstation => 1,
            HeapKind::Server { heap_count } => heap_count.max(1),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapInitError {
    HandleTables,
    SegmentReservation,
}

struct NoGcRegionInfo {
    in_progress: bool,
    soh_budget: usize,
    loh_budget: usize,
    soh_allocated: usize,
    loh_allocated: usize,
    num_gcs_induced: usize,
    budget_exceeded: bool,
    disallow_full_blocking: bool,
}

impl NoGcRegionInfo {
    const fn cleared() -> Self {
        Self {
            in_progress: false,
            soh_budget: 0,
            loh_budget: 0,
            soh_allocated: 0,
            loh_allocated: 0,
            num_gcs_induced: 0,
            budget_exceeded: false,
            disallow_full_blocking: false,
        }
    }
}

struct FinalizeQueue {
    registered: Vec<*mut GcObject>,
    ready: Vec<*mut GcObject>,
    /// [registered count, ready count]; the diagnostic reader sees this
    /// array through `GcDacVars`.
    fill_pointers: [usize; 2],
}

impl FinalizeQueue {
    fn new() -> Self {
        Self {
            registered: Vec::new(),
            ready: Vec::new(),
            fill_pointers: [0; 2],
        }
    }

    fn refresh_fill_pointers(&mut self) {
        self.fill_pointers[0] = self.registered.len();
        self.fill_pointers[1] = self.ready.len();
    }
}

struct HeapInner {
    generations: Box<[Generation; TOTAL_GENERATION_COUNT]>,
    soh_segments: Vec<Box<HeapSegment>>,
    large_segments: Vec<Box<HeapSegment>>,
    frozen_segments: Vec<Box<HeapSegment>>,
    /// Reclaimed gaps, address-ordered per heap flavor.
    soh_free: Vec<(usize, usize)>,
    large_free: Vec<(usize, usize)>,
    finalize_queue: FinalizeQueue,
    no_gc: NoGcRegionInfo,
    oom: OomHistory,
    ephemeral_low: usize,
    ephemeral_high: usize,
    /// Backing memory of the software write-watch table, when this heap
    /// bound one.
    ww_table: Option<Mmap>,
    ww_failed: bool,
}

struct BackgroundGcState {
    lock: Mutex<bool>,
    complete: Condvar,
}

/// The collector's public surface toward the execution engine; a small,
/// closed set of implementations selected once at process start.
pub trait GcHeap: Send + Sync {
    /// Allocates `size` payload bytes from the context's bump region or the
    /// synchronized slow path. Null on out-of-memory; never panics.
    fn alloc(&self, acx: &mut GcAllocContext, size: usize, flags: GcAllocFlags) -> *mut GcObject;

    /// Large-object allocation, independent of any thread context.
    fn alloc_lheap(&self, size: usize, flags: GcAllocFlags) -> *mut GcObject;

    /// As `alloc` with an 8-byte alignment bias for the payload.
    fn alloc_align8(
        &self,
        acx: &mut GcAllocContext,
        size: usize,
        flags: GcAllocFlags,
    ) -> *mut GcObject;

    /// Requests a collection of `generation` (negative means the whole
    /// heap).
    fn garbage_collect(&self, generation: i32, low_memory: bool, mode: GcCollectionMode)
        -> GcStatus;

    fn start_no_gc_region(
        &self,
        total_size: u64,
        loh_size_known: bool,
        loh_size: u64,
        disallow_full_blocking: bool,
    ) -> StartNoGcRegionStatus;

    fn end_no_gc_region(&self) -> EndNoGcRegionStatus;

    fn is_concurrent_gc_in_progress(&self) -> bool;
    fn wait_until_concurrent_gc_complete(&self);
    fn wait_until_concurrent_gc_complete_async(&self, timeout_ms: u32) -> GcWaitStatus;

    fn register_frozen_segment(&self, info: &FrozenSegmentInfo) -> Option<FrozenSegmentHandle>;
    fn unregister_frozen_segment(&self, handle: FrozenSegmentHandle);

    fn get_last_oom(&self) -> OomHistory;
    fn max_generation(&self) -> u32;
    fn get_gc_count(&self) -> u64;
    fn dac_vars(&self) -> GcDacVars;

    // Diagnostic walks; consistent only while the engine is suspended.
    fn diag_walk_heap(&self, walk: &mut dyn FnMut(*mut GcObject, usize));
    fn diag_walk_object(&self, object: *mut GcObject, walk: &mut dyn FnMut(*mut GcObject, usize));
    fn diag_scan_handles(&self, visit: &mut dyn FnMut(ObjectHandle, *mut GcObject));
    fn diag_descr_generations(&self, descr: &mut dyn FnMut(u32, *mut u8, *mut u8));
}

pub struct Heap {
    ee: Arc<dyn GcToExecutionEngine>,
    config: Config,
    kind: HeapKind,
    // All of `inner` is guarded by `gc_lock`; the teacher-style UnsafeCell
    // keeps the slow path free of nested lock types.
    inner: UnsafeCell<HeapInner>,
    gc_lock: Mutex<()>,
    phase: Atomic<GcPhase>,
    gc_index: AtomicU64,
    lowest: AtomicUsize,
    highest: AtomicUsize,
    background: BackgroundGcState,
    shutdown: AtomicBool,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

/// Selects and builds the collector for this process. Handle tables are
/// initialized as a side effect; a failure there is fatal to startup and
/// reported upward.
pub fn init_gc_heap(
    kind: HeapKind,
    ee: Arc<dyn GcToExecutionEngine>,
    config: Config,
) -> Result<Box<Heap>, HeapInitError> {
    if !HandleManager::initialize(kind.heap_count()) {
        return Err(HeapInitError::HandleTables);
    }

    let soh = HeapSegment::reserve(config.segment_size, config.initial_commit)
        .ok_or(HeapInitError::SegmentReservation)?;
    let large = HeapSegment::reserve(config.large_segment_size, config.initial_commit)
        .ok_or(HeapInitError::SegmentReservation)?;

    let mut generations: Box<[Generation; TOTAL_GENERATION_COUNT]> = Box::new([
        Generation::new(0),
        Generation::new(1),
        Generation::new(2),
        Generation::new(LARGE_OBJECT_GENERATION),
    ]);

    let mut soh = soh;
    let mut large = large;
    for gen in generations.iter_mut().take(3) {
        gen.start_segment = &mut *soh;
        gen.allocation_segment = &mut *soh;
    }
    generations[3].start_segment = &mut *large;
    generations[3].allocation_segment = &mut *large;

    let ephemeral_low = soh.start() as usize;
    let ephemeral_high = soh.reserved_end() as usize;
    let inner = HeapInner {
        generations,
        soh_segments: vec![soh],
        large_segments: vec![large],
        frozen_segments: Vec::new(),
        soh_free: Vec::new(),
        large_free: Vec::new(),
        finalize_queue: FinalizeQueue::new(),
        no_gc: NoGcRegionInfo::cleared(),
        oom: OomHistory::none(),
        ephemeral_low,
        ephemeral_high,
        ww_table: None,
        ww_failed: false,
    };

    let heap = Box::new(Heap {
        ee,
        config,
        kind,
        inner: UnsafeCell::new(inner),
        gc_lock: Mutex::new(()),
        phase: Atomic::new(GcPhase::Idle),
        gc_index: AtomicU64::new(0),
        lowest: AtomicUsize::new(0),
        highest: AtomicUsize::new(0),
        background: BackgroundGcState {
            lock: Mutex::new(false),
            complete: Condvar::new(),
        },
        shutdown: AtomicBool::new(false),
    });

    {
        let _guard = heap.gc_lock.lock();
        let inner = unsafe { heap.inner_mut() };
        heap.recompute_bounds(inner);
        heap.bind_write_watch_table(inner);
        let mut params = heap.barrier_params(inner, WriteBarrierOp::Initialize, true);
        params.requires_upper_bounds_check = true;
        heap.ee.stomp_write_barrier(&params);
    }
    Ok(heap)
}

impl Heap {
    /// Caller must hold `gc_lock`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner_mut(&self) -> &mut HeapInner {
        &mut *self.inner.get()
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn current_phase(&self) -> GcPhase {
        self.phase.load(atomic::Ordering::Acquire)
    }

    fn recompute_bounds(&self, inner: &HeapInner) {
        let mut lowest = usize::MAX;
        let mut highest = 0usize;
        for seg in inner
            .soh_segments
            .iter()
            .chain(inner.large_segments.iter())
        {
            lowest = lowest.min(seg.start() as usize);
            highest = highest.max(seg.reserved_end() as usize);
        }
        self.lowest.store(lowest, Ordering::Release);
        self.highest.store(highest, Ordering::Release);
    }

    /// Binds (or re-binds after growth) the software write-watch table to
    /// the current heap bounds. Allocation failure disables the feature for
    /// the process; collection falls back to full scans.
    fn bind_write_watch_table(&self, inner: &mut HeapInner) {
        if inner.ww_failed {
            return;
        }
        let lowest = self.lowest.load(Ordering::Acquire);
        let highest = self.highest.load(Ordering::Acquire);
        let table_size = write_watch::table_size_for_range(lowest, highest);
        let map = Mmap::reserve(align_usize(table_size, write_watch::WRITE_WATCH_PAGE_SIZE));
        if !map.is_reserved() || !map.commit(map.start(), map.size()) {
            inner.ww_failed = true;
            inner.ww_table = None;
            fire_event!(
                GcEventKeyword::GC,
                GcEventLevel::Warning,
                "software write-watch table allocation failed; feature disabled"
            );
            return;
        }
        if inner.ww_table.is_none() {
            write_watch::initialize_untranslated_table(map.start(), lowest, highest);
        } else {
            write_watch::set_resized_untranslated_table(map.start(), lowest, highest);
        }
        // The old table (if any) is freed here, after the singleton has been
        // repointed.
        inner.ww_table = Some(map);
    }

    fn barrier_params(
        &self,
        inner: &HeapInner,
        operation: WriteBarrierOp,
        is_runtime_suspended: bool,
    ) -> WriteBarrierParameters {
        let mut params = WriteBarrierParameters::new(operation, is_runtime_suspended);
        params.lowest_address = self.lowest.load(Ordering::Acquire) as *mut u8;
        params.highest_address = self.highest.load(Ordering::Acquire) as *mut u8;
        params.ephemeral_low = inner.ephemeral_low as *mut u8;
        params.ephemeral_high = inner.ephemeral_high as *mut u8;
        params.write_watch_table = inner
            .ww_table
            .as_ref()
            .map(|m| m.start())
            .unwrap_or(null_mut());
        params
    }

    fn total_object_size(size: usize, flags: GcAllocFlags) -> usize {
        let mut total = align_usize(size + size_of::<ObjectHeader>(), ALLOCATION_GRANULARITY);
        if flags.intersects(GcAllocFlags::ALIGN8 | GcAllocFlags::ALIGN8_BIAS) {
            total = align_usize(total, 8);
        }
        total
    }

    unsafe fn install_header(
        &self,
        mem: *mut u8,
        total: usize,
        flags: GcAllocFlags,
    ) -> *mut GcObject {
        let header = mem as *mut ObjectHeader;
        let mut h = ObjectHeader::new(total);
        if flags.contains(GcAllocFlags::CONTAINS_REF) {
            h.set_contains_refs();
        }
        if flags.contains(GcAllocFlags::FINALIZE) {
            h.set_finalizable();
        }
        header.write(h);
        let object = (*header).object();
        if flags.contains(GcAllocFlags::FINALIZE) {
            let _guard = self.gc_lock.lock();
            let inner = self.inner_mut();
            inner.finalize_queue.registered.push(object);
            inner.finalize_queue.refresh_fill_pointers();
        }
        object
    }

    #[cold]
    fn alloc_slow(
        &self,
        acx: &mut GcAllocContext,
        total: usize,
        flags: GcAllocFlags,
    ) -> *mut GcObject {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };

        for attempt in 0..2 {
            if let Some((start, len)) = self.carve_soh_region(inner, total, flags) {
                unsafe {
                    acx.replenish(start as *mut u8, (start + len) as *mut u8);
                    let mem = acx.fast_alloc(total);
                    debug_assert!(!mem.is_null());
                    return self.install_header_locked(inner, mem, total, flags);
                }
            }
            if attempt == 0 && !inner.no_gc.in_progress {
                self.collect_locked(inner, MAX_GENERATION, GcCollectionMode::DEFAULT, false);
            } else {
                break;
            }
        }

        let seg = inner.generations[0].allocation_segment;
        inner.oom = OomHistory {
            reason: OomReason::CantCommit,
            alloc_size: total,
            available_commit: if seg.is_null() {
                0
            } else {
                unsafe { (*seg).committed_remaining() }
            },
            gc_index: self.gc_index.load(Ordering::Relaxed),
            is_large_object_heap: false,
        };
        fire_event!(
            GcEventKeyword::GC,
            GcEventLevel::Error,
            "small-object allocation of {} bytes failed",
            total
        );
        null_mut()
    }

    /// Like `install_header` but the lock is already held.
    unsafe fn install_header_locked(
        &self,
        inner: &mut HeapInner,
        mem: *mut u8,
        total: usize,
        flags: GcAllocFlags,
    ) -> *mut GcObject {
        let header = mem as *mut ObjectHeader;
        let mut h = ObjectHeader::new(total);
        if flags.contains(GcAllocFlags::CONTAINS_REF) {
            h.set_contains_refs();
        }
        if flags.contains(GcAllocFlags::FINALIZE) {
            h.set_finalizable();
        }
        header.write(h);
        let object = (*header).object();
        if flags.contains(GcAllocFlags::FINALIZE) {
            inner.finalize_queue.registered.push(object);
            inner.finalize_queue.refresh_fill_pointers();
        }
        object
    }

    /// Finds or creates a region of at least `total` bytes for a context to
    /// bump through. Caller holds `gc_lock`.
    fn carve_soh_region(
        &self,
        inner: &mut HeapInner,
        total: usize,
        flags: GcAllocFlags,
    ) -> Option<(usize, usize)> {
        let mut want = total.max(self.config.alloc_quantum);
        if inner.no_gc.in_progress {
            // Inside a no-GC region the rest of the budget is handed out as
            // one contiguous region, charged in full. Any allocation mix that
            // fits the budget then fits the region without another carve, so
            // the budget verdict tracks what the caller allocated.
            let remaining = inner
                .no_gc
                .soh_budget
                .saturating_sub(inner.no_gc.soh_allocated);
            want = total.max(crate::align_usize(remaining, 8));
        } else if let Some(pos) = inner.soh_free.iter().position(|&(_, len)| len >= total) {
            // Reclaimed gaps first. Skipped during a no-GC region; gaps
            // fragment the budget.
            let (start, len) = inner.soh_free.remove(pos);
            if !flags.contains(GcAllocFlags::ZEROING_OPTIONAL) {
                unsafe {
                    core::ptr::write_bytes(start as *mut u8, 0, len);
                }
            }
            return Some((start, len));
        }

        // Then the allocation segment's committed tail, growing commit and
        // finally reserving a new segment.
        loop {
            let seg = unsafe { &mut *inner.generations[0].allocation_segment };
            if seg.committed_remaining() >= want {
                let start = seg.allocated as usize;
                unsafe {
                    seg.allocated = seg.allocated.add(want);
                }
                seg.check_invariants();
                inner.generations[0].allocation_size += want;
                self.note_no_gc_alloc(inner, want, false);
                self.note_ephemeral_bounds(inner);
                return Some((start, want));
            }
            if seg.grow_commit(want.max(self.config.initial_commit)) {
                continue;
            }
            if !self.add_soh_segment(inner) {
                return None;
            }
        }
    }

    /// Reserves a fresh small-object segment and repoints the ephemeral
    /// generations at it. Heap bounds change, so the write-watch table is
    /// resized and the barrier stomped.
    fn add_soh_segment(&self, inner: &mut HeapInner) -> bool {
        let seg = match HeapSegment::reserve(self.config.segment_size, self.config.initial_commit)
        {
            Some(seg) => seg,
            None => return false,
        };
        inner.soh_segments.push(seg);
        let seg_ptr: *mut HeapSegment = &mut **inner.soh_segments.last_mut().unwrap();
        unsafe {
            // Chain for the diagnostic walker.
            let prev = inner.generations[0].allocation_segment;
            (*prev).next = seg_ptr;
        }
        for gen in inner.generations.iter_mut().take(3) {
            gen.allocation_segment = seg_ptr;
        }
        self.recompute_bounds(inner);
        self.bind_write_watch_table(inner);
        self.note_ephemeral_bounds(inner);
        let params = self.barrier_params(inner, WriteBarrierOp::StompResize, false);
        self.ee.stomp_write_barrier(&params);
        true
    }

    fn note_ephemeral_bounds(&self, inner: &mut HeapInner) {
        let seg = unsafe { &*inner.generations[0].allocation_segment };
        inner.ephemeral_low = seg.start() as usize;
        inner.ephemeral_high = seg.reserved_end() as usize;
    }

    fn note_no_gc_alloc(&self, inner: &mut HeapInner, bytes: usize, large: bool) {
        if !inner.no_gc.in_progress {
            return;
        }
        if large {
            inner.no_gc.loh_allocated += bytes;
            if inner.no_gc.loh_budget != 0 && inner.no_gc.loh_allocated > inner.no_gc.loh_budget {
                inner.no_gc.budget_exceeded = true;
            }
        } else {
            inner.no_gc.soh_allocated += bytes;
            if inner.no_gc.soh_allocated > inner.no_gc.soh_budget {
                inner.no_gc.budget_exceeded = true;
            }
        }
    }

    fn alloc_large_locked(&self, total: usize, flags: GcAllocFlags) -> *mut GcObject {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };

        for attempt in 0..2 {
            if let Some(pos) = inner.large_free.iter().position(|&(_, len)| len >= total) {
                let (start, len) = inner.large_free.remove(pos);
                // Return the tail of an oversized gap to the free list.
                if len > total {
                    inner.large_free.push((start + total, len - total));
                    unsafe {
                        (*((start + total) as *mut ObjectHeader)).make_free(len - total);
                    }
                }
                if !flags.contains(GcAllocFlags::ZEROING_OPTIONAL) {
                    unsafe {
                        core::ptr::write_bytes(start as *mut u8, 0, total);
                    }
                }
                self.note_no_gc_alloc(inner, total, true);
                return unsafe { self.install_header_locked(inner, start as *mut u8, total, flags) };
            }

            let seg = unsafe { &mut *inner.generations[3].allocation_segment };
            if seg.committed_remaining() >= total || seg.grow_commit(total) {
                let start = seg.allocated;
                unsafe {
                    seg.allocated = seg.allocated.add(total);
                }
                seg.check_invariants();
                inner.generations[3].allocation_size += total;
                self.note_no_gc_alloc(inner, total, true);
                return unsafe { self.install_header_locked(inner, start, total, flags) };
            }

            if attempt == 0 && !inner.no_gc.in_progress {
                self.collect_locked(inner, MAX_GENERATION, GcCollectionMode::DEFAULT, false);
            }
        }

        inner.oom = OomHistory {
            reason: OomReason::LargeObjectHeap,
            alloc_size: total,
            available_commit: unsafe {
                (*inner.generations[3].allocation_segment).committed_remaining()
            },
            gc_index: self.gc_index.load(Ordering::Relaxed),
            is_large_object_heap: true,
        };
        null_mut()
    }

    /// Plants free gaps over every live allocation context's unused tail so
    /// the heap is walkable, then detaches the regions. Mutators are
    /// suspended here.
    fn fix_allocation_contexts(&self) {
        self.ee.enum_alloc_contexts(&mut |acx: &mut GcAllocContext| {
            Self::fix_one_context(acx);
        });
    }

    fn fix_one_context(acx: &mut GcAllocContext) {
        if !acx.alloc_ptr.is_null() {
            let remaining = acx.remaining();
            if remaining >= size_of::<ObjectHeader>() {
                unsafe {
                    (*(acx.alloc_ptr as *mut ObjectHeader)).make_free(remaining);
                }
            }
        }
        acx.reset_region();
    }

    /// The blocking collection body. Caller holds `gc_lock`; `external`
    /// marks collections forced from outside an active no-GC region.
    fn collect_locked(
        &self,
        inner: &mut HeapInner,
        mut condemned: u32,
        _mode: GcCollectionMode,
        external: bool,
    ) {
        if inner.no_gc.in_progress {
            if !external {
                return;
            }
            inner.no_gc.num_gcs_induced += 1;
        }

        let index = self.gc_index.fetch_add(1, Ordering::AcqRel) + 1;
        fire_event!(
            GcEventKeyword::GC | GcEventKeyword::HEAP_COLLECT,
            GcEventLevel::Information,
            "gc {} starting, condemned generation {}",
            index,
            condemned
        );

        self.phase.store(GcPhase::Preparing, atomic::Ordering::Release);
        self.ee.suspend_ee(SuspendReason::ForGc);
        self.fix_allocation_contexts();
        for gen in inner.generations.iter_mut() {
            Self::fix_one_context(&mut gen.allocation_context);
        }

        // A big enough sized-ref payload forces a full collection.
        if condemned < MAX_GENERATION
            && scan::sized_ref_total() >= self.config.sized_ref_full_gc_threshold
        {
            condemned = MAX_GENERATION;
        }

        self.phase.store(GcPhase::Marking, atomic::Ordering::Release);
        self.mark_phase(condemned, &inner.finalize_queue.ready);

        self.phase.store(GcPhase::Planning, atomic::Ordering::Release);
        self.phase
            .store(GcPhase::Relocating, atomic::Ordering::Release);
        // Non-compacting collector: nothing moves, but handle targets are
        // still refreshed through the same pass the compacting flavor uses.
        scan::update_pointers(condemned, &mut |object| object);

        self.phase.store(GcPhase::Sweeping, atomic::Ordering::Release);
        self.finalize_and_sweep(inner, condemned);
        scan::age_handles(condemned, MAX_GENERATION);

        self.note_ephemeral_bounds(inner);
        if write_watch::is_enabled_for_gc_heap() {
            self.clear_dirty_heap(inner);
        }
        let params = self.barrier_params(inner, WriteBarrierOp::StompEphemeral, true);
        self.ee.stomp_write_barrier(&params);

        self.phase.store(GcPhase::Idle, atomic::Ordering::Release);
        self.ee.restart_ee();
        fire_event!(
            GcEventKeyword::GC | GcEventKeyword::HEAP_COLLECT,
            GcEventLevel::Information,
            "gc {} complete",
            index
        );
    }

    fn mark_phase(&self, condemned: u32, ready_to_finalize: &[*mut GcObject]) {
        let mark = |object: *mut GcObject, pinned: bool| unsafe {
            let header = &*ObjectHeader::from_object(object);
            header.set_marked();
            if pinned {
                header.set_pinned(true);
            }
        };
        scan::scan_handles_for_promotion(condemned, &mut |object, pinned| mark(object, pinned));
        // Objects awaiting their finalizer are roots until the host drains
        // them; short weak handles observe this rooting, not resurrection.
        for &object in ready_to_finalize {
            mark(object, false);
        }
        let is_promoted =
            |object: *mut GcObject| unsafe { (*ObjectHeader::from_object(object)).is_marked() };
        scan::promote_dependent_handles(condemned, &is_promoted, &mut |object, pinned| {
            mark(object, pinned)
        });
        scan::sever_unreachable_weak_short(condemned, &is_promoted);
    }

    fn finalize_and_sweep(&self, inner: &mut HeapInner, condemned: u32) {
        // Unreachable finalizable objects are resurrected onto the ready
        // queue; long weak handles observe this, short weak handles already
        // severed before it.
        let mut still_registered = Vec::with_capacity(inner.finalize_queue.registered.len());
        for &object in &inner.finalize_queue.registered {
            let header = unsafe { &*ObjectHeader::from_object(object) };
            if header.is_marked() {
                still_registered.push(object);
            } else {
                header.set_marked();
                inner.finalize_queue.ready.push(object);
            }
        }
        inner.finalize_queue.registered = still_registered;
        inner.finalize_queue.refresh_fill_pointers();

        let is_promoted =
            |object: *mut GcObject| unsafe { (*ObjectHeader::from_object(object)).is_marked() };
        scan::sever_unreachable_weak_long(condemned, &is_promoted);

        let mut soh_free = Vec::new();
        for seg in inner.soh_segments.iter() {
            Self::sweep_segment(seg, &mut soh_free);
        }
        inner.soh_free = soh_free;
        let mut large_free = Vec::new();
        for seg in inner.large_segments.iter() {
            Self::sweep_segment(seg, &mut large_free);
        }
        inner.large_free = large_free;

        // Frozen objects are never reclaimed, but their mark bits must not
        // leak into the next collection.
        for seg in inner.frozen_segments.iter() {
            unsafe {
                crate::segment::walk_object_range(
                    seg.first_object(),
                    seg.allocated,
                    &mut |header, _| {
                        (*header).clear_marked();
                        true
                    },
                );
            }
        }
    }

    fn sweep_segment(seg: &HeapSegment, free: &mut Vec<(usize, usize)>) {
        let mut pending: Option<(usize, usize)> = None;
        unsafe {
            crate::segment::walk_object_range(seg.first_object(), seg.allocated, &mut |header,
                                                                                       size| {
                let dead = (*header).is_free() || !(*header).is_marked();
                if dead {
                    (*header).make_free(size);
                    pending = match pending {
                        // Coalesce adjacent gaps.
                        Some((start, len)) if start + len == header as usize => {
                            Some((start, len + size))
                        }
                        Some(chunk) => {
                            free.push(chunk);
                            Some((header as usize, size))
                        }
                        None => Some((header as usize, size)),
                    };
                } else {
                    (*header).clear_marked();
                }
                true
            });
        }
        if let Some((start, len)) = pending {
            free.push((start, len));
            unsafe {
                (*(start as *mut ObjectHeader)).make_free(len);
            }
        }
    }

    fn clear_dirty_heap(&self, inner: &HeapInner) {
        for seg in inner
            .soh_segments
            .iter()
            .chain(inner.large_segments.iter())
        {
            let base = seg.start() as usize;
            let len = seg.committed as usize - base;
            if len > 0 {
                write_watch::clear_dirty(base, len);
            }
        }
    }

    /// Background collection body, run on the collector-owned thread.
    fn background_collect(&self) {
        {
            let _guard = self.gc_lock.lock();
            let inner = unsafe { self.inner_mut() };

            self.phase.store(GcPhase::Preparing, atomic::Ordering::Release);
            self.ee.suspend_ee(SuspendReason::ForGcPrep);
            self.fix_allocation_contexts();
            for gen in inner.generations.iter_mut() {
                Self::fix_one_context(&mut gen.allocation_context);
            }

            let ww_available = inner.ww_table.is_some();
            if ww_available && !write_watch::is_enabled_for_gc_heap() {
                write_watch::enable_for_gc_heap();
                let params =
                    self.barrier_params(inner, WriteBarrierOp::SwitchToWriteWatch, true);
                self.ee.stomp_write_barrier(&params);
            }

            self.phase.store(GcPhase::Marking, atomic::Ordering::Release);
            // Initial scan only promotes; weak severing waits for the final
            // pause so handles created during the concurrent window count.
            let mark = |object: *mut GcObject, pinned: bool| unsafe {
                let header = &*ObjectHeader::from_object(object);
                header.set_marked();
                if pinned {
                    header.set_pinned(true);
                }
            };
            scan::scan_handles_for_promotion(MAX_GENERATION, &mut |object, pinned| {
                mark(object, pinned)
            });
            for &object in inner.finalize_queue.ready.iter() {
                mark(object, false);
            }
            self.ee.restart_ee();
        }

        // Mutators run here; the write barrier records their stores in the
        // dirty table.

        {
            let _guard = self.gc_lock.lock();
            let inner = unsafe { self.inner_mut() };
            self.ee.suspend_ee(SuspendReason::ForGc);
            self.fix_allocation_contexts();
            for gen in inner.generations.iter_mut() {
                Self::fix_one_context(&mut gen.allocation_context);
            }

            if write_watch::is_enabled_for_gc_heap() {
                self.drain_dirty_pages(inner);
            }

            // Revisit roots created or retargeted during concurrent marking.
            self.mark_phase(MAX_GENERATION, &inner.finalize_queue.ready);

            self.phase.store(GcPhase::Planning, atomic::Ordering::Release);
            self.phase
                .store(GcPhase::Relocating, atomic::Ordering::Release);
            scan::update_pointers(MAX_GENERATION, &mut |object| object);

            self.phase.store(GcPhase::Sweeping, atomic::Ordering::Release);
            self.finalize_and_sweep(inner, MAX_GENERATION);
            scan::age_handles(MAX_GENERATION, MAX_GENERATION);

            if write_watch::is_enabled_for_gc_heap() {
                self.clear_dirty_heap(inner);
                write_watch::disable_for_gc_heap();
                let params =
                    self.barrier_params(inner, WriteBarrierOp::SwitchToNonWriteWatch, true);
                self.ee.stomp_write_barrier(&params);
            }
            self.note_ephemeral_bounds(inner);
            let params = self.barrier_params(inner, WriteBarrierOp::StompEphemeral, true);
            self.ee.stomp_write_barrier(&params);

            self.phase.store(GcPhase::Idle, atomic::Ordering::Release);
            self.gc_index.fetch_add(1, Ordering::AcqRel);
            self.ee.restart_ee();
        }

        let mut in_progress = self.background.lock.lock();
        *in_progress = false;
        self.background.complete.notify_all();
    }

    /// Re-examines every page mutated during concurrent marking. With an
    /// opaque object model there is nothing to trace inside the pages, but
    /// the drain still exercises the contract: scan, then clear, bounded
    /// buffer at a time.
    fn drain_dirty_pages(&self, inner: &HeapInner) {
        let mut pages = [null_mut::<u8>(); 64];
        for seg in inner
            .soh_segments
            .iter()
            .chain(inner.large_segments.iter())
        {
            let base = seg.start() as usize;
            let len = seg.committed as usize - base;
            if len == 0 {
                continue;
            }
            loop {
                let count = write_watch::get_dirty(base, len, &mut pages, true, true);
                if count < pages.len() {
                    break;
                }
            }
        }
    }
}

impl GcHeap for Heap {
    fn alloc(&self, acx: &mut GcAllocContext, size: usize, flags: GcAllocFlags) -> *mut GcObject {
        let total = Self::total_object_size(size, flags);
        if flags.contains(GcAllocFlags::LARGE_OBJECT_HEAP) || total >= LARGE_OBJECT_SIZE {
            let object = self.alloc_large_locked(total, flags);
            if !object.is_null() {
                acx.alloc_bytes_uoh += total as i64;
            }
            return object;
        }
        let mem = acx.fast_alloc(total);
        if !mem.is_null() {
            return unsafe { self.install_header(mem, total, flags) };
        }
        self.alloc_slow(acx, total, flags)
    }

    fn alloc_lheap(&self, size: usize, flags: GcAllocFlags) -> *mut GcObject {
        let total = Self::total_object_size(size, flags);
        self.alloc_large_locked(total, flags)
    }

    fn alloc_align8(
        &self,
        acx: &mut GcAllocContext,
        size: usize,
        flags: GcAllocFlags,
    ) -> *mut GcObject {
        self.alloc(acx, size, flags | GcAllocFlags::ALIGN8)
    }

    fn garbage_collect(
        &self,
        generation: i32,
        _low_memory: bool,
        mode: GcCollectionMode,
    ) -> GcStatus {
        let condemned = if generation < 0 {
            MAX_GENERATION
        } else {
            (generation as u32).min(MAX_GENERATION)
        };

        if mode.contains(GcCollectionMode::NON_BLOCKING) {
            return self.start_background_collection();
        }

        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        self.collect_locked(inner, condemned, mode, true);
        GcStatus::Succeeded
    }

    fn start_no_gc_region(
        &self,
        total_size: u64,
        loh_size_known: bool,
        loh_size: u64,
        disallow_full_blocking: bool,
    ) -> StartNoGcRegionStatus {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        if inner.no_gc.in_progress {
            return StartNoGcRegionStatus::AlreadyInProgress;
        }
        let total = total_size as usize;
        if total > self.config.segment_size {
            return StartNoGcRegionStatus::AmountTooLarge;
        }
        // The budget must be physically satisfiable up front.
        let seg = unsafe { &mut *inner.generations[0].allocation_segment };
        if seg.committed_remaining() < total && !seg.grow_commit(total - seg.committed_remaining())
        {
            return StartNoGcRegionStatus::NotEnoughMemory;
        }
        inner.no_gc = NoGcRegionInfo {
            in_progress: true,
            // Budgets round up to object alignment; carves stay within them.
            soh_budget: crate::align_usize(total, 8),
            loh_budget: if loh_size_known {
                crate::align_usize(loh_size as usize, 8)
            } else {
                0
            },
            soh_allocated: 0,
            loh_allocated: 0,
            num_gcs_induced: 0,
            budget_exceeded: false,
            disallow_full_blocking,
        };
        StartNoGcRegionStatus::Succeeded
    }

    fn end_no_gc_region(&self) -> EndNoGcRegionStatus {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        if !inner.no_gc.in_progress {
            return EndNoGcRegionStatus::NotInProgress;
        }
        let status = if inner.no_gc.num_gcs_induced > 0 {
            EndNoGcRegionStatus::GcInduced
        } else if inner.no_gc.budget_exceeded {
            EndNoGcRegionStatus::AllocExceeded
        } else {
            EndNoGcRegionStatus::Succeeded
        };
        inner.no_gc = NoGcRegionInfo::cleared();
        status
    }

    fn is_concurrent_gc_in_progress(&self) -> bool {
        *self.background.lock.lock()
    }

    fn wait_until_concurrent_gc_complete(&self) {
        let mut in_progress = self.background.lock.lock();
        while *in_progress {
            self.background.complete.wait(&mut in_progress);
        }
    }

    fn wait_until_concurrent_gc_complete_async(&self, timeout_ms: u32) -> GcWaitStatus {
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64);
        let mut in_progress = self.background.lock.lock();
        while *in_progress {
            if self
                .background
                .complete
                .wait_until(&mut in_progress, deadline)
                .timed_out()
            {
                return if *in_progress {
                    GcWaitStatus::Timeout
                } else {
                    GcWaitStatus::Signaled
                };
            }
        }
        GcWaitStatus::Signaled
    }

    fn register_frozen_segment(&self, info: &FrozenSegmentInfo) -> Option<FrozenSegmentHandle> {
        if info.base.is_null() || info.allocated_size > info.reserved_size {
            return None;
        }
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        let seg = HeapSegment::frozen(
            info.base,
            unsafe { info.base.add(info.allocated_size) },
            unsafe { info.base.add(info.reserved_size) },
        );
        inner.frozen_segments.push(seg);
        let raw: *mut HeapSegment = &mut **inner.frozen_segments.last_mut().unwrap();
        Some(FrozenSegmentHandle(raw))
    }

    fn unregister_frozen_segment(&self, handle: FrozenSegmentHandle) {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        inner
            .frozen_segments
            .retain(|seg| &**seg as *const HeapSegment as *mut HeapSegment != handle.0);
    }

    fn get_last_oom(&self) -> OomHistory {
        let _guard = self.gc_lock.lock();
        unsafe { self.inner_mut().oom }
    }

    fn max_generation(&self) -> u32 {
        MAX_GENERATION
    }

    fn get_gc_count(&self) -> u64 {
        self.gc_index.load(Ordering::Acquire)
    }

    fn dac_vars(&self) -> GcDacVars {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        GcDacVars {
            major_version: DAC_MAJOR_VERSION,
            minor_version: DAC_MINOR_VERSION,
            generation_table: inner.generations.as_ptr(),
            total_generation_count: TOTAL_GENERATION_COUNT as u32,
            max_generation: MAX_GENERATION,
            lowest_address: self.lowest.load(Ordering::Acquire) as *const u8,
            highest_address: self.highest.load(Ordering::Acquire) as *const u8,
            handle_table_map: HandleManager::map() as *const _,
            finalize_queue_fill_pointers: inner.finalize_queue.fill_pointers.as_ptr(),
            finalize_queue_fill_pointer_count: inner.finalize_queue.fill_pointers.len() as u32,
            heap_count: self.kind.heap_count() as u32,
            oom_history: &inner.oom,
        }
    }

    fn diag_walk_heap(&self, walk: &mut dyn FnMut(*mut GcObject, usize)) {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        for seg in inner
            .soh_segments
            .iter()
            .chain(inner.large_segments.iter())
            .chain(inner.frozen_segments.iter())
        {
            unsafe {
                crate::segment::walk_object_range(
                    seg.first_object(),
                    seg.allocated,
                    &mut |header, size| {
                        if !(*header).is_free() {
                            walk((*header).object(), size);
                        }
                        true
                    },
                );
            }
        }
    }

    fn diag_walk_object(&self, object: *mut GcObject, walk: &mut dyn FnMut(*mut GcObject, usize)) {
        if object.is_null() {
            return;
        }
        unsafe {
            let header = &*ObjectHeader::from_object(object);
            walk(object, header.get_size());
        }
    }

    fn diag_scan_handles(&self, visit: &mut dyn FnMut(ObjectHandle, *mut GcObject)) {
        scan::diag_scan_handles(visit);
    }

    fn diag_descr_generations(&self, descr: &mut dyn FnMut(u32, *mut u8, *mut u8)) {
        let _guard = self.gc_lock.lock();
        let inner = unsafe { self.inner_mut() };
        for gen in inner.generations.iter() {
            unsafe {
                let seg = &*gen.allocation_segment;
                descr(gen.gen_num, seg.first_object(), seg.allocated);
            }
        }
    }
}

impl Heap {
    /// Hands every object awaiting finalization to the host and unroots it.
    /// Finalizers run outside any collector lock.
    pub fn drain_ready_finalizable(&self, each: &mut dyn FnMut(*mut GcObject)) {
        let drained = {
            let _guard = self.gc_lock.lock();
            let inner = unsafe { self.inner_mut() };
            let drained = std::mem::take(&mut inner.finalize_queue.ready);
            inner.finalize_queue.refresh_fill_pointers();
            drained
        };
        for object in drained {
            each(object);
        }
    }

    pub fn ready_finalizable_count(&self) -> usize {
        let _guard = self.gc_lock.lock();
        unsafe { self.inner_mut().finalize_queue.ready.len() }
    }

    /// Kicks off a background collection on a collector-owned thread. Falls
    /// back to a blocking collection when the engine refuses to create one.
    fn start_background_collection(&self) -> GcStatus {
        {
            let mut in_progress = self.background.lock.lock();
            if *in_progress {
                return GcStatus::Succeeded;
            }
            *in_progress = true;
        }

        // The heap outlives the background thread: `Drop` waits for
        // completion before tearing anything down.
        let this = unsafe { &*(self as *const Heap) };
        let spawned = self
            .ee
            .create_background_thread(Box::new(move || this.background_collect()));
        match spawned {
            Some(_) => GcStatus::Succeeded,
            None => {
                {
                    let mut in_progress = self.background.lock.lock();
                    *in_progress = false;
                    self.background.complete.notify_all();
                }
                let _guard = self.gc_lock.lock();
                let inner = unsafe { self.inner_mut() };
                self.collect_locked(inner, MAX_GENERATION, GcCollectionMode::BLOCKING, true);
                GcStatus::Succeeded
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wait_until_concurrent_gc_complete();
        let inner = unsafe { self.inner_mut() };
        if inner.ww_table.is_some() {
            write_watch::static_close();
        }
    }
}
