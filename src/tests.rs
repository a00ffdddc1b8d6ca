use std::ptr::null_mut;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc_context::GcAllocContext;
use crate::ee::DefaultExecutionEngine;
use crate::handles::{
    self, HandleManager, HandleType, VHT_STRONG, VHT_WEAK_SHORT,
};
use crate::heap::{
    init_gc_heap, EndNoGcRegionStatus, FrozenSegmentInfo, GcAllocFlags, GcCollectionMode, GcHeap,
    GcWaitStatus, Heap, HeapKind, OomReason, StartNoGcRegionStatus, LARGE_OBJECT_SIZE,
    MAX_GENERATION, TOTAL_GENERATION_COUNT,
};
use crate::object::ObjectHeader;
use crate::write_watch;
use crate::Config;

// The handle manager and the write-watch table are process-wide; tests that
// touch either take this lock so they never observe each other's state.
static SERIAL: Mutex<()> = parking_lot::const_mutex(());

fn small_config() -> Config {
    Config {
        segment_size: 8 * 1024 * 1024,
        large_segment_size: 8 * 1024 * 1024,
        initial_commit: 128 * 1024,
        alloc_quantum: 8 * 1024,
        ..Default::default()
    }
}

fn with_heap_config(config: Config, f: impl FnOnce(&DefaultExecutionEngine, &Heap)) {
    let _serial = SERIAL.lock();
    let ee = Arc::new(DefaultExecutionEngine::new());
    let heap = init_gc_heap(HeapKind::Workstation, ee.clone(), config).unwrap();
    f(&ee, &heap);
    drop(heap);
    HandleManager::shutdown();
}

fn with_heap(f: impl FnOnce(&DefaultExecutionEngine, &Heap)) {
    with_heap_config(small_config(), f);
}

fn gc(heap: &Heap) {
    heap.garbage_collect(-1, false, GcCollectionMode::BLOCKING);
}

#[test]
pub fn test_strong_handle_keeps_object_weak_short_severed() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 48, GcAllocFlags::NO_FLAGS);
        assert!(!obj.is_null());

        let store = HandleManager::get_global_handle_store();
        let strong = store.create_handle_of_type(obj, HandleType::Strong);
        let weak = store.create_handle_of_type(obj, HandleType::WeakShort);
        assert!(store.contains_handle(strong) && store.contains_handle(weak));

        gc(heap);
        assert_eq!(handles::object_from_handle(strong), obj);
        assert_eq!(handles::object_from_handle(weak), obj);

        HandleManager::destroy_handle_of_type(strong, HandleType::Strong);
        gc(heap);
        assert!(handles::object_from_handle(weak).is_null());

        HandleManager::destroy_handle_of_unknown_type(weak);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_dependent_handle_follows_primary() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let primary = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let secondary = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let dep = store.create_dependent_handle(primary, secondary);
        let root = store.create_handle_of_type(primary, HandleType::Strong);
        // Secondary has no root of its own; the dependent pair must carry it.
        let probe = store.create_handle_of_type(secondary, HandleType::WeakShort);

        gc(heap);
        assert_eq!(handles::object_from_handle(dep), primary);
        assert_eq!(handles::get_dependent_handle_secondary(dep), secondary);
        assert_eq!(handles::object_from_handle(probe), secondary);

        // Once the primary dies the collector severs both halves.
        HandleManager::destroy_handle_of_type(root, HandleType::Strong);
        gc(heap);
        assert!(handles::object_from_handle(dep).is_null());
        assert!(handles::get_dependent_handle_secondary(dep).is_null());
        assert!(handles::object_from_handle(probe).is_null());

        HandleManager::destroy_handle_of_unknown_type(dep);
        HandleManager::destroy_handle_of_unknown_type(probe);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_dependent_chain_promotes_transitively() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let a = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let b = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let c = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        // The b -> c pair sits before a -> b in slot order, so a single pass
        // cannot have seen b promoted yet; promotion must reach fixed point.
        let tail = store.create_dependent_handle(b, c);
        let head = store.create_dependent_handle(a, b);
        let root = store.create_handle_of_type(a, HandleType::Strong);
        let probe = store.create_handle_of_type(c, HandleType::WeakShort);

        gc(heap);
        assert_eq!(handles::object_from_handle(probe), c);

        // Once the chain's only root dies the whole chain goes.
        HandleManager::destroy_handle_of_type(root, HandleType::Strong);
        gc(heap);
        assert!(handles::object_from_handle(probe).is_null());
        assert!(handles::get_dependent_handle_secondary(head).is_null());
        assert!(handles::get_dependent_handle_secondary(tail).is_null());

        HandleManager::destroy_handle_of_unknown_type(head);
        HandleManager::destroy_handle_of_unknown_type(tail);
        HandleManager::destroy_handle_of_unknown_type(probe);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_finalization_resurrection() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::FINALIZE);
        assert!(!obj.is_null());

        let store = HandleManager::get_global_handle_store();
        let short = store.create_handle_of_type(obj, HandleType::WeakShort);
        let long = store.create_handle_of_type(obj, HandleType::WeakLong);

        // First collection: the object is promoted onto the ready queue. The
        // short weak does not track that, the long weak does.
        gc(heap);
        assert!(handles::object_from_handle(short).is_null());
        assert_eq!(handles::object_from_handle(long), obj);
        assert_eq!(heap.ready_finalizable_count(), 1);

        let mut finalized = Vec::new();
        heap.drain_ready_finalizable(&mut |o| finalized.push(o));
        assert_eq!(finalized, vec![obj]);
        assert_eq!(heap.ready_finalizable_count(), 0);

        // With the finalizer run the object is truly dead.
        gc(heap);
        assert!(handles::object_from_handle(long).is_null());

        HandleManager::destroy_handle_of_unknown_type(short);
        HandleManager::destroy_handle_of_unknown_type(long);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_variable_handle_changes_strength() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let var = store.create_handle_with_extra_info(obj, HandleType::Variable, VHT_STRONG);
        gc(heap);
        assert_eq!(handles::object_from_handle(var), obj);

        handles::update_variable_handle_type(var, VHT_WEAK_SHORT);
        assert_eq!(handles::get_variable_handle_type(var), VHT_WEAK_SHORT);
        gc(heap);
        assert!(handles::object_from_handle(var).is_null());

        HandleManager::destroy_handle_of_unknown_type(var);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_ref_counted_handle_strength_follows_count() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let rc = store.create_handle_with_extra_info(obj, HandleType::RefCounted, 2);
        gc(heap);
        assert_eq!(handles::object_from_handle(rc), obj);

        handles::set_handle_extra_info(rc, 0);
        gc(heap);
        assert!(handles::object_from_handle(rc).is_null());

        HandleManager::destroy_handle_of_unknown_type(rc);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_duplicate_handle_copies_kind_and_extra() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let sized = store.create_handle_with_extra_info(obj, HandleType::SizedRef, 777);
        let dup = HandleManager::create_duplicate_handle(sized);
        assert!(!dup.is_null());
        assert_ne!(dup, sized);
        assert_eq!(handles::handle_fetch_type(dup), Some(HandleType::SizedRef));
        assert_eq!(handles::object_from_handle(dup), obj);
        assert_eq!(handles::get_handle_extra_info(dup), 777);

        HandleManager::destroy_handle_of_unknown_type(sized);
        HandleManager::destroy_handle_of_unknown_type(dup);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_interlocked_handle_updates() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let a = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let b = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let handle = store.create_handle_of_type(null_mut(), HandleType::Strong);

        assert!(handles::store_object_in_handle_if_null(handle, a));
        assert!(!handles::store_object_in_handle_if_null(handle, b));
        assert_eq!(handles::object_from_handle(handle), a);

        // Failed exchange reports the current target and stores nothing.
        let prev = handles::interlocked_compare_exchange_object_in_handle(handle, b, null_mut());
        assert_eq!(prev, a);
        assert_eq!(handles::object_from_handle(handle), a);
        let prev = handles::interlocked_compare_exchange_object_in_handle(handle, b, a);
        assert_eq!(prev, a);
        assert_eq!(handles::object_from_handle(handle), b);

        HandleManager::destroy_handle_of_unknown_type(handle);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_store_membership_and_teardown() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let global = HandleManager::get_global_handle_store();
        let unit = HandleManager::create_handle_store().unwrap();
        assert_ne!(unit.index(), global.index());

        let in_unit = unit.create_handle_of_type(obj, HandleType::Strong);
        let in_global = global.create_handle_of_type(obj, HandleType::Strong);
        assert!(unit.contains_handle(in_unit));
        assert!(!global.contains_handle(in_unit));
        assert!(global.contains_handle(in_global));
        assert!(!unit.contains_handle(in_global));
        assert_eq!(unit.handle_count(), 1);

        unit.uproot();
        assert!(unit.is_uprooted());
        unsafe {
            HandleManager::destroy_handle_store(unit);
        }

        // The global store is unaffected by the teardown.
        gc(heap);
        assert_eq!(handles::object_from_handle(in_global), obj);
        HandleManager::destroy_handle_of_unknown_type(in_global);
        // A destroyed handle is no longer a member, even though its slot
        // memory is still there to be recycled.
        assert!(!global.contains_handle(in_global));
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_store_indices_stable_as_map_grows() {
    with_heap(|_, _| {
        let mut stores = Vec::new();
        // Push the map past one segment's worth of entries.
        for _ in 0..70 {
            stores.push(HandleManager::create_handle_store().unwrap());
        }
        let first = stores[0];
        let first_index = first.index();
        let handle = first.create_handle_of_type(null_mut(), HandleType::Strong);

        // Resolution through the map still lands in the original store.
        let dup = HandleManager::create_duplicate_handle(handle);
        assert!(!dup.is_null());
        assert!(first.contains_handle(dup));
        assert_eq!(first.index(), first_index);

        HandleManager::destroy_handle_of_unknown_type(handle);
        HandleManager::destroy_handle_of_unknown_type(dup);
        for store in stores {
            store.uproot();
            unsafe {
                HandleManager::destroy_handle_store(store);
            }
        }
    });
}

#[test]
pub fn test_async_pinned_relocation() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let done = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let pending = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let unit = HandleManager::create_handle_store().unwrap();
        let target = HandleManager::get_global_handle_store();
        unit.create_handle_of_type(done, HandleType::AsyncPinned);
        unit.create_handle_of_type(pending, HandleType::AsyncPinned);

        let mut relocated = Vec::new();
        unit.relocate_async_pinned_handles(
            target,
            &mut |object| object == done,
            &mut |object, handle| relocated.push((object, handle)),
        );

        // Every async-pinned handle left the unit store; the incomplete one
        // was re-created in the target.
        assert_eq!(unit.handle_count(), 0);
        assert_eq!(relocated.len(), 1);
        let (object, moved) = relocated[0];
        assert_eq!(object, pending);
        assert!(target.contains_handle(moved));
        assert_eq!(handles::object_from_handle(moved), pending);
        assert_eq!(
            handles::handle_fetch_type(moved),
            Some(HandleType::AsyncPinned)
        );

        HandleManager::destroy_handle_of_unknown_type(moved);
        unit.uproot();
        unsafe {
            HandleManager::destroy_handle_store(unit);
        }
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_no_gc_region_lifecycle() {
    with_heap(|ee, heap| {
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::NotInProgress);

        assert_eq!(
            heap.start_no_gc_region(1024 * 1024, false, 0, false),
            StartNoGcRegionStatus::Succeeded
        );
        assert_eq!(
            heap.start_no_gc_region(1024, false, 0, false),
            StartNoGcRegionStatus::AlreadyInProgress
        );

        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 64, GcAllocFlags::NO_FLAGS);
        assert!(!obj.is_null());
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::Succeeded);

        // A budget that cannot hold one allocation request.
        assert_eq!(
            heap.start_no_gc_region(4096, false, 0, false),
            StartNoGcRegionStatus::Succeeded
        );
        let mut fresh = GcAllocContext::new();
        ee.attach_alloc_context(&mut fresh);
        let big = heap.alloc(&mut fresh, 16 * 1024, GcAllocFlags::NO_FLAGS);
        assert!(!big.is_null());
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::AllocExceeded);

        // An induced collection trumps a blown budget.
        assert_eq!(
            heap.start_no_gc_region(4096, false, 0, false),
            StartNoGcRegionStatus::Succeeded
        );
        gc(heap);
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::GcInduced);

        assert_eq!(
            heap.start_no_gc_region(u64::MAX, false, 0, false),
            StartNoGcRegionStatus::AmountTooLarge
        );

        ee.detach_alloc_context(&mut acx);
        ee.detach_alloc_context(&mut fresh);
    });
}

#[test]
pub fn test_no_gc_region_small_budget_spans_allocations() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);

        // A budget far below the carve quantum; the region hands out budget
        // bytes, not quantum bytes, so small allocations fit.
        assert_eq!(
            heap.start_no_gc_region(4096, false, 0, false),
            StartNoGcRegionStatus::Succeeded
        );
        for _ in 0..8 {
            assert!(!heap.alloc(&mut acx, 64, GcAllocFlags::NO_FLAGS).is_null());
        }
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::Succeeded);

        // A mix that refills the context mid-region still fits the budget.
        assert_eq!(
            heap.start_no_gc_region(16 * 1024, false, 0, false),
            StartNoGcRegionStatus::Succeeded
        );
        assert!(!heap.alloc(&mut acx, 64, GcAllocFlags::NO_FLAGS).is_null());
        assert!(!heap
            .alloc(&mut acx, 8 * 1024, GcAllocFlags::NO_FLAGS)
            .is_null());
        assert_eq!(heap.end_no_gc_region(), EndNoGcRegionStatus::Succeeded);

        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_large_objects_route_to_large_heap_and_recycle() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);

        // At or above the threshold the context is bypassed.
        let large = heap.alloc(&mut acx, LARGE_OBJECT_SIZE, GcAllocFlags::NO_FLAGS);
        assert!(!large.is_null());
        assert!(acx.alloc_bytes_uoh > 0);
        assert_eq!(acx.alloc_bytes, 0);

        let store = HandleManager::get_global_handle_store();
        let weak = store.create_handle_of_type(large, HandleType::WeakShort);
        gc(heap);
        assert!(handles::object_from_handle(weak).is_null());

        // The swept chunk is reused for an identically sized request.
        let again = heap.alloc_lheap(LARGE_OBJECT_SIZE, GcAllocFlags::NO_FLAGS);
        assert_eq!(again, large);

        HandleManager::destroy_handle_of_unknown_type(weak);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_large_alloc_failure_records_oom() {
    let config = Config {
        large_segment_size: 2 * 1024 * 1024,
        ..small_config()
    };
    with_heap_config(config, |_, heap| {
        assert_eq!(heap.get_last_oom().reason, OomReason::None);
        let failed = heap.alloc_lheap(4 * 1024 * 1024, GcAllocFlags::NO_FLAGS);
        assert!(failed.is_null());
        let oom = heap.get_last_oom();
        assert_eq!(oom.reason, OomReason::LargeObjectHeap);
        assert!(oom.is_large_object_heap);
        assert!(oom.alloc_size >= 4 * 1024 * 1024);
    });
}

#[test]
pub fn test_background_collection_completes_and_severs() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let store = HandleManager::get_global_handle_store();
        let weak = store.create_handle_of_type(obj, HandleType::WeakShort);
        let before = heap.get_gc_count();

        heap.garbage_collect(-1, false, GcCollectionMode::NON_BLOCKING);
        heap.wait_until_concurrent_gc_complete();
        assert!(!heap.is_concurrent_gc_in_progress());
        assert_eq!(
            heap.wait_until_concurrent_gc_complete_async(10),
            GcWaitStatus::Signaled
        );
        assert!(heap.get_gc_count() > before);
        assert!(handles::object_from_handle(weak).is_null());

        HandleManager::destroy_handle_of_unknown_type(weak);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_diagnostic_snapshot() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let store = HandleManager::get_global_handle_store();
        let strong = store.create_handle_of_type(obj, HandleType::Strong);

        let vars = heap.dac_vars();
        assert_eq!(vars.major_version, crate::dac::DAC_MAJOR_VERSION);
        assert_eq!(vars.total_generation_count, TOTAL_GENERATION_COUNT as u32);
        assert_eq!(vars.max_generation, MAX_GENERATION);
        assert_eq!(vars.heap_count, 1);
        assert_eq!(vars.finalize_queue_fill_pointer_count, 2);
        assert!(!vars.generation_table.is_null());
        assert!(!vars.handle_table_map.is_null());
        assert!(!vars.oom_history.is_null());
        assert!((vars.lowest_address as usize) < vars.highest_address as usize);
        unsafe {
            assert_eq!((*vars.generation_table).gen_num, 0);
        }

        let mut seen = Vec::new();
        heap.diag_scan_handles(&mut |handle, target| seen.push((handle, target)));
        assert!(seen.iter().any(|&(h, t)| h == strong && t == obj));

        let mut walked = 0usize;
        heap.diag_walk_heap(&mut |_, size| {
            assert!(size >= core::mem::size_of::<ObjectHeader>());
            walked += 1;
        });
        assert!(walked >= 1);

        let mut described = 0;
        heap.diag_descr_generations(&mut |_, low, high| {
            assert!(low <= high);
            described += 1;
        });
        assert_eq!(described, TOTAL_GENERATION_COUNT);

        HandleManager::destroy_handle_of_unknown_type(strong);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_frozen_segment_walkable_but_never_swept() {
    with_heap(|_, heap| {
        const FROZEN_SIZE: usize = 968;
        let mut backing = vec![0u8; 4096];
        let base = backing.as_mut_ptr();
        unsafe {
            (base.add(crate::segment::SEGMENT_FIRST_OBJECT_OFFSET) as *mut ObjectHeader)
                .write(ObjectHeader::new(FROZEN_SIZE));
        }
        let info = FrozenSegmentInfo {
            base,
            allocated_size: crate::segment::SEGMENT_FIRST_OBJECT_OFFSET + FROZEN_SIZE,
            reserved_size: 4096,
        };
        let token = heap.register_frozen_segment(&info).unwrap();

        let count_frozen = |heap: &Heap| {
            let mut count = 0;
            heap.diag_walk_heap(&mut |_, size| {
                if size == FROZEN_SIZE {
                    count += 1;
                }
            });
            count
        };
        assert_eq!(count_frozen(heap), 1);

        // Collections clear marks in frozen ranges but reclaim nothing.
        gc(heap);
        assert_eq!(count_frozen(heap), 1);
        unsafe {
            let header =
                &*(base.add(crate::segment::SEGMENT_FIRST_OBJECT_OFFSET) as *const ObjectHeader);
            assert!(!header.is_marked());
            assert!(!header.is_free());
        }

        heap.unregister_frozen_segment(token);
        assert_eq!(count_frozen(heap), 0);
    });
}

#[test]
pub fn test_gc_resets_allocation_contexts() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 48, GcAllocFlags::NO_FLAGS);
        assert!(!obj.is_null());
        assert!(!acx.alloc_ptr.is_null());

        gc(heap);
        assert!(acx.alloc_ptr.is_null());
        assert!(acx.alloc_limit.is_null());

        // The context is replenished transparently on the next request.
        let next = heap.alloc(&mut acx, 48, GcAllocFlags::NO_FLAGS);
        assert!(!next.is_null());
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_write_watch_round_trip() {
    let _serial = SERIAL.lock();
    const PAGE: usize = write_watch::WRITE_WATCH_PAGE_SIZE;
    let lowest = 0x4000_0000usize;
    let highest = lowest + 16 * PAGE;
    let mut table = vec![0u8; write_watch::table_size_for_range(lowest, highest)];
    write_watch::initialize_untranslated_table(table.as_mut_ptr(), lowest, highest);

    write_watch::set_dirty(lowest + 5 * PAGE + 8, 8);
    write_watch::set_dirty_region(lowest + 8 * PAGE, 2 * PAGE);

    let mut pages = [null_mut::<u8>(); 16];
    let count = write_watch::get_dirty(lowest, 16 * PAGE, &mut pages, false, true);
    assert_eq!(count, 3);
    assert_eq!(pages[0] as usize, lowest + 5 * PAGE);
    assert_eq!(pages[1] as usize, lowest + 8 * PAGE);
    assert_eq!(pages[2] as usize, lowest + 9 * PAGE);

    // A full buffer signals that more pages may remain.
    let mut tiny = [null_mut::<u8>(); 2];
    assert_eq!(
        write_watch::get_dirty(lowest, 16 * PAGE, &mut tiny, false, true),
        2
    );

    // Clearing while scanning empties the table.
    let count = write_watch::get_dirty(lowest, 16 * PAGE, &mut pages, true, true);
    assert_eq!(count, 3);
    assert_eq!(
        write_watch::get_dirty(lowest, 16 * PAGE, &mut pages, false, true),
        0
    );

    write_watch::clear_dirty(lowest, 16 * PAGE);
    assert_eq!(write_watch::static_close(), table.as_mut_ptr());
}

#[test]
pub fn test_write_watch_resize_preserves_dirty_state() {
    let _serial = SERIAL.lock();
    const PAGE: usize = write_watch::WRITE_WATCH_PAGE_SIZE;
    let lowest = 0x4000_0000usize;
    let highest = lowest + 8 * PAGE;
    let mut table = vec![0u8; write_watch::table_size_for_range(lowest, highest)];
    write_watch::initialize_untranslated_table(table.as_mut_ptr(), lowest, highest);
    write_watch::set_dirty(lowest + 3 * PAGE, 8);

    // Grow downward and upward around the old range.
    let new_lowest = lowest - 4 * PAGE;
    let new_highest = highest + 4 * PAGE;
    let mut bigger = vec![0u8; write_watch::table_size_for_range(new_lowest, new_highest)];
    let old = write_watch::set_resized_untranslated_table(
        bigger.as_mut_ptr(),
        new_lowest,
        new_highest,
    );
    assert_eq!(old, table.as_mut_ptr());

    let mut pages = [null_mut::<u8>(); 16];
    let count = write_watch::get_dirty(new_lowest, 16 * PAGE, &mut pages, false, true);
    assert_eq!(count, 1);
    assert_eq!(pages[0] as usize, lowest + 3 * PAGE);

    // Enable/disable toggles gate the barrier's dirty marking.
    assert!(!write_watch::is_enabled_for_gc_heap());
    write_watch::enable_for_gc_heap();
    assert!(write_watch::is_enabled_for_gc_heap());
    write_watch::disable_for_gc_heap();

    assert_eq!(write_watch::static_close(), bigger.as_mut_ptr());
}

#[test]
pub fn test_handle_aging_skips_old_handles_in_ephemeral_scans() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let weak = store.create_handle_of_type(obj, HandleType::WeakShort);

        // A full collection ages the handle past generation 0.
        gc(heap);
        assert!(handles::object_from_handle(weak).is_null());
        handles::store_object_in_handle(weak, obj);

        // The retarget reset its age, so an ephemeral collection still sees
        // it and severs again.
        heap.garbage_collect(0, false, GcCollectionMode::BLOCKING);
        assert!(handles::object_from_handle(weak).is_null());

        HandleManager::destroy_handle_of_unknown_type(weak);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_pinned_handle_sets_pin_bit() {
    with_heap(|ee, heap| {
        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);

        let store = HandleManager::get_global_handle_store();
        let pin = store.create_handle_of_type(obj, HandleType::Pinned);
        gc(heap);

        assert_eq!(handles::object_from_handle(pin), obj);
        unsafe {
            assert!((*ObjectHeader::from_object(obj)).is_pinned());
        }
        HandleManager::destroy_handle_of_type(pin, HandleType::Pinned);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_native_weak_sever_callback() {
    static SEVERED: Mutex<Vec<usize>> = parking_lot::const_mutex(Vec::new());

    fn record(extra: usize) {
        SEVERED.lock().push(extra);
    }

    with_heap(|ee, heap| {
        SEVERED.lock().clear();
        HandleManager::set_native_weak_sever_callback(record);

        let mut acx = GcAllocContext::new();
        ee.attach_alloc_context(&mut acx);
        let obj = heap.alloc(&mut acx, 32, GcAllocFlags::NO_FLAGS);
        let store = HandleManager::get_global_handle_store();
        let native = store.create_handle_with_extra_info(obj, HandleType::WeakNativeCom, 0xBEEF);

        gc(heap);
        assert!(handles::object_from_handle(native).is_null());
        assert_eq!(handles::get_handle_extra_info(native), 0);
        assert_eq!(*SEVERED.lock(), vec![0xBEEF]);

        HandleManager::destroy_handle_of_unknown_type(native);
        ee.detach_alloc_context(&mut acx);
    });
}

#[test]
pub fn test_barrier_stomps_carry_heap_bounds() {
    with_heap(|ee, heap| {
        // Initialization already stomped once with the full bounds.
        assert!(ee.stomp_count() >= 1);
        let params = ee.last_stomp().unwrap();
        assert!(!params.lowest_address.is_null());
        assert!(params.lowest_address < params.highest_address);

        gc(heap);
        let params = ee.last_stomp().unwrap();
        assert_eq!(params.operation, crate::ee::WriteBarrierOp::StompEphemeral);
        assert!(!params.ephemeral_low.is_null());
        assert!(params.ephemeral_low < params.ephemeral_high);
    });
}
