//! Reference resolution and synchronous retargeting.
//!
//! Writing a reference output produces one rebind request per registered
//! observer. Requests are processed inside the writer's own call chain —
//! before any subscriber scheduled for the same tick runs — so dependents
//! observe the new target within the tick of the retarget.

use super::{InputBinding, InputSlot, binding_at_path_mut};
use crate::node::NodeId;
use crate::ts::arena::{RebindRequest, TsArena, TsId};
use crate::ts::data::{RefValue, TsData};
use tracing::trace;

/// The slot a reference output currently points at, if it is singly bound.
/// `Empty` and `Unbound` composites resolve to none; an atomic link through
/// them reads as invalid until the reference binds.
pub fn resolve_ref_target(arena: &TsArena, ref_output: TsId) -> Option<TsId> {
    arena.ref_value(ref_output).target()
}

/// Follow bound references to the storage they name. Bounded so a
/// pathological reference cycle degrades to returning the last slot instead
/// of spinning.
pub fn deref_ts(arena: &TsArena, id: TsId) -> TsId {
    let mut cur = id;
    for _ in 0..64 {
        match &arena.slot(cur).data {
            TsData::Ref(RefValue::Bound(target)) if arena.contains(*target) => cur = *target,
            _ => return cur,
        }
    }
    cur
}

/// Apply one rebind to the observing input: swap the deref link's target to
/// the reference's current value, moving the node's subscription with it.
/// Active state is preserved; a link that no longer matches the reference
/// output (already unbound) is left untouched.
pub fn rebind_link(arena: &mut TsArena, node: NodeId, slot: &mut InputSlot, req: &RebindRequest) {
    let active = slot.active;
    let Some(binding) = binding_at_path_mut(&mut slot.binding, &req.observer.path) else {
        return;
    };
    let InputBinding::Deref { ref_output, target } = binding else {
        return;
    };
    if *ref_output != req.ref_output {
        return;
    }
    let new_target = resolve_ref_target(arena, req.ref_output);
    if *target == new_target {
        return;
    }
    let old_target = *target;
    *target = new_target;
    trace!(
        node = node.0,
        input = req.observer.input,
        "reference retarget"
    );
    if active {
        if let Some(old) = old_target {
            if arena.contains(old) {
                arena.unsubscribe(old, node);
            }
        }
        if let Some(new) = new_target {
            arena.subscribe(new, node);
        }
    }
}
