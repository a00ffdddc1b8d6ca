//! Root-scanning passes over the handle tables. Every pass here requires
//! mutators suspended; the only always-safe query is
//! [`super::HandleStore::contains_handle`].

use std::ptr::null_mut;

use super::manager::HandleManager;
use super::{
    HandleSlot, HandleType, ObjectHandle, VHT_MASK, VHT_PINNED, VHT_STRONG, VHT_WEAK_LONG,
    VHT_WEAK_SHORT,
};
use crate::object::GcObject;

/// Visits a strong root. `pinned` forbids relocating the target.
pub type PromoteFn<'a> = &'a mut dyn FnMut(*mut GcObject, bool);

/// Answers whether an object survived marking (directly or transitively).
pub type IsPromotedFn<'a> = &'a dyn Fn(*mut GcObject) -> bool;

#[inline]
fn scan_filter(slot: &HandleSlot, condemned: u32) -> bool {
    // Variable handles can change strength at any time, so they are scanned
    // on every collection regardless of age.
    slot.age() as u32 <= condemned || slot.handle_type() == Some(HandleType::Variable)
}

fn for_each_scannable(condemned: u32, visit: &mut dyn FnMut(&HandleSlot)) {
    HandleManager::for_each_rooted_store(&mut |store| {
        store.bucket().for_each_slot(&mut |slot| {
            if scan_filter(slot, condemned) {
                visit(slot);
            }
        });
    });
}

/// Pass (a): promote strong and pinned roots of the condemned generations.
pub fn scan_handles_for_promotion(condemned: u32, promote: PromoteFn) {
    for_each_scannable(condemned, &mut |slot| {
        let object = slot.object();
        if object.is_null() {
            return;
        }
        match slot.handle_type() {
            Some(HandleType::Strong) | Some(HandleType::SizedRef) => promote(object, false),
            Some(HandleType::Pinned) | Some(HandleType::AsyncPinned) => promote(object, true),
            Some(HandleType::RefCounted) => {
                if slot.extra() > 0 {
                    promote(object, false);
                }
            }
            Some(HandleType::Variable) => match slot.extra() & VHT_MASK {
                VHT_STRONG => promote(object, false),
                VHT_PINNED => promote(object, true),
                _ => {}
            },
            _ => {}
        }
    });
}

/// Pass (c), one iteration: promote secondaries whose primary is promoted.
/// Returns true if anything new was promoted; a secondary may itself be the
/// primary of another pair, so the caller must iterate to fixed point.
pub fn scan_dependent_handles_for_promotion(
    condemned: u32,
    is_promoted: IsPromotedFn,
    promote: PromoteFn,
) -> bool {
    let mut promoted_any = false;
    for_each_scannable(condemned, &mut |slot| {
        if slot.handle_type() != Some(HandleType::Dependent) {
            return;
        }
        let primary = slot.object();
        let secondary = slot.extra() as *mut GcObject;
        if !primary.is_null()
            && !secondary.is_null()
            && is_promoted(primary)
            && !is_promoted(secondary)
        {
            promote(secondary, false);
            promoted_any = true;
        }
    });
    promoted_any
}

/// Runs the dependent-handle pass to fixed point.
pub fn promote_dependent_handles(condemned: u32, is_promoted: IsPromotedFn, promote: PromoteFn) {
    while scan_dependent_handles_for_promotion(condemned, is_promoted, promote) {}
}

/// Pass (b): sever short-weak handles whose target did not survive. Runs
/// before finalization promotion, so short weaks never observe resurrection.
/// Native-weak handles additionally report their extra word to the
/// registered sever callback.
pub fn sever_unreachable_weak_short(condemned: u32, is_promoted: IsPromotedFn) {
    for_each_scannable(condemned, &mut |slot| {
        let severs = match slot.handle_type() {
            Some(HandleType::WeakShort) | Some(HandleType::WeakNativeCom) => true,
            Some(HandleType::Variable) => slot.extra() & VHT_MASK == VHT_WEAK_SHORT,
            _ => false,
        };
        if !severs {
            return;
        }
        let object = slot.object();
        if object.is_null() || is_promoted(object) {
            return;
        }
        if slot.handle_type() == Some(HandleType::WeakNativeCom) {
            HandleManager::native_weak_sever(slot.extra());
            slot.set_extra(0);
        }
        slot.set_object(null_mut());
    });
}

/// Severs long-weak handles, conditionally-weak ref-counted handles, and
/// dead dependent pairs. Runs after finalization promotion so these track
/// resurrection.
pub fn sever_unreachable_weak_long(condemned: u32, is_promoted: IsPromotedFn) {
    for_each_scannable(condemned, &mut |slot| {
        match slot.handle_type() {
            Some(HandleType::WeakLong) => {
                let object = slot.object();
                if !object.is_null() && !is_promoted(object) {
                    slot.set_object(null_mut());
                }
            }
            Some(HandleType::RefCounted) => {
                let object = slot.object();
                if slot.extra() == 0 && !object.is_null() && !is_promoted(object) {
                    slot.set_object(null_mut());
                }
            }
            Some(HandleType::Variable) => {
                if slot.extra() & VHT_MASK == VHT_WEAK_LONG {
                    let object = slot.object();
                    if !object.is_null() && !is_promoted(object) {
                        slot.set_object(null_mut());
                    }
                }
            }
            Some(HandleType::Dependent) => {
                // The collector, not the mutator, severs the secondary when
                // the primary dies.
                let primary = slot.object();
                if !primary.is_null() && !is_promoted(primary) {
                    slot.set_object(null_mut());
                    slot.set_extra(0);
                }
            }
            _ => {}
        }
    });
}

/// Rewrites handle targets (and dependent secondaries) after relocation.
pub fn update_pointers(condemned: u32, relocate: &mut dyn FnMut(*mut GcObject) -> *mut GcObject) {
    for_each_scannable(condemned, &mut |slot| {
        let object = slot.object();
        if !object.is_null() {
            let moved = relocate(object);
            if moved != object {
                slot.set_object(moved);
            }
        }
        if slot.handle_type() == Some(HandleType::Dependent) {
            let secondary = slot.extra() as *mut GcObject;
            if !secondary.is_null() {
                let moved = relocate(secondary);
                if moved != secondary {
                    slot.set_extra(moved as usize);
                }
            }
        }
    });
}

/// Pass (d): ages every scanned handle so future collections of younger
/// generations skip it cheaply.
pub fn age_handles(condemned: u32, max_generation: u32) {
    for_each_scannable(condemned, &mut |slot| {
        let promoted_to = (condemned + 1).min(max_generation).max(slot.age() as u32);
        slot.set_age(promoted_to as u8);
    });
}

/// Collector-invoked enumeration letting the interop layer recompute
/// ref-counted strength during a scan (the callback typically updates the
/// external count through `set_handle_extra_info`).
pub fn trace_ref_counted_handles(callback: &mut dyn FnMut(ObjectHandle)) {
    HandleManager::for_each_rooted_store(&mut |store| {
        store.bucket().for_each_slot(&mut |slot| {
            if slot.handle_type() == Some(HandleType::RefCounted) {
                callback(ObjectHandle::from_slot(slot as *const _ as *mut HandleSlot));
            }
        });
    });
}

/// Sum of the user-supplied sizes on all sized-ref handles; consulted by the
/// full-collection heuristic.
pub fn sized_ref_total() -> usize {
    let mut total = 0usize;
    HandleManager::for_each_rooted_store(&mut |store| {
        store.bucket().for_each_slot(&mut |slot| {
            if slot.handle_type() == Some(HandleType::SizedRef) {
                total = total.saturating_add(slot.extra());
            }
        });
    });
    total
}

/// Diagnostic enumeration of every live handle. Consistent only while the
/// execution engine is suspended.
pub fn diag_scan_handles(visit: &mut dyn FnMut(ObjectHandle, *mut GcObject)) {
    HandleManager::for_each_rooted_store(&mut |store| {
        store.bucket().for_each_slot(&mut |slot| {
            visit(
                ObjectHandle::from_slot(slot as *const _ as *mut HandleSlot),
                slot.object(),
            );
        });
    });
}
