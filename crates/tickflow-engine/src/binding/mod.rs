//! Input bindings: the edges from input positions to output slots.
//!
//! Exactly one binding exists per input position. A `Peer` shares the
//! output's slot outright (including atomic containers whose elements are
//! references). A `Deref` follows a reference output's current target and is
//! rebound by the reference subsystem when the output retargets. A
//! `Composite` recurses per-child over bundles and fixed lists with mixed
//! edge kinds below.
//!
//! Active state is a subscription: an input is active iff its node sits in
//! the observer list of every slot the binding resolves through. Binding and
//! unbinding preserve the active flag.

pub mod reference;

use crate::node::NodeId;
use crate::schema::{Schema, SchemaMatch, TsKind, match_schemas};
use crate::ts::arena::{ChildPath, RefObserver, TsArena, TsId};
use reference::resolve_ref_target;
use std::sync::Arc;
use tickflow_common::{EngineError, EngineTime, MIN_TIME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputBinding {
    /// Not wired; reads as invalid.
    Unbound,
    /// Shares the output slot (schemas identical, or an atomic container
    /// edge).
    Peer(TsId),
    /// Follows `ref_output`'s current target.
    Deref {
        ref_output: TsId,
        target: Option<TsId>,
    },
    /// Per-child edges of mixed kinds.
    Composite { children: Vec<InputBinding> },
}

#[derive(Debug)]
pub struct InputSlot {
    pub name: Arc<str>,
    pub schema: Schema,
    pub binding: InputBinding,
    pub active: bool,
}

impl InputSlot {
    pub fn new(name: impl Into<Arc<str>>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            binding: InputBinding::Unbound,
            active: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self.binding, InputBinding::Unbound)
    }
}

/// Bind `slot` to `output`, replacing any existing edge. Active state is
/// preserved across the rebind.
pub fn bind_input(
    arena: &mut TsArena,
    node: NodeId,
    input_index: u16,
    slot: &mut InputSlot,
    output: TsId,
) -> Result<(), EngineError> {
    if slot.is_bound() {
        unbind_input(arena, node, input_index, slot);
    }
    let mut path = ChildPath::new();
    let binding = build_binding(arena, node, input_index, &mut path, &slot.schema, output)?;
    slot.binding = binding;
    if slot.active {
        subscribe_binding(arena, node, &slot.binding);
    }
    Ok(())
}

/// Remove the binding, releasing subscriptions and reference observers.
pub fn unbind_input(arena: &mut TsArena, node: NodeId, input_index: u16, slot: &mut InputSlot) {
    if slot.active {
        unsubscribe_binding(arena, node, &slot.binding);
    }
    let mut path = ChildPath::new();
    release_ref_observers(arena, node, input_index, &mut path, &slot.binding);
    slot.binding = InputBinding::Unbound;
}

/// Flip the active flag, adjusting subscriptions to match.
pub fn set_input_active(arena: &mut TsArena, node: NodeId, slot: &mut InputSlot, active: bool) {
    if slot.active == active {
        return;
    }
    slot.active = active;
    if active {
        subscribe_binding(arena, node, &slot.binding);
    } else {
        unsubscribe_binding(arena, node, &slot.binding);
    }
}

fn build_binding(
    arena: &mut TsArena,
    node: NodeId,
    input_index: u16,
    path: &mut ChildPath,
    schema: &Schema,
    output: TsId,
) -> Result<InputBinding, EngineError> {
    let out_schema = arena.slot(output).schema.clone();
    match match_schemas(schema, &out_schema) {
        SchemaMatch::Peer => Ok(InputBinding::Peer(output)),
        SchemaMatch::Deref => {
            arena.add_ref_observer(
                output,
                RefObserver {
                    node,
                    input: input_index,
                    path: path.clone(),
                },
            );
            let target = resolve_ref_target(arena, output);
            Ok(InputBinding::Deref {
                ref_output: output,
                target,
            })
        }
        SchemaMatch::Composite => match schema.kind() {
            TsKind::Bundle(_) | TsKind::List { .. } => {
                let mut children = Vec::with_capacity(schema.child_count());
                for i in 0..schema.child_count() {
                    let child_schema = schema
                        .child(i)
                        .ok_or_else(|| EngineError::internal("composite child schema missing"))?
                        .clone();
                    let child_output = arena.child_at(output, i).ok_or_else(|| {
                        EngineError::internal("composite output child missing")
                    })?;
                    path.push(i as u16);
                    let child =
                        build_binding(arena, node, input_index, path, &child_schema, child_output)?;
                    path.pop();
                    children.push(child);
                }
                Ok(InputBinding::Composite { children })
            }
            // Maps, sets, windows, and dynamic lists whose elements involve
            // references bind whole-container; the delta is recomputed by
            // elementwise comparison when a target changes.
            _ => Ok(InputBinding::Peer(output)),
        },
        SchemaMatch::Mismatch => {
            // A REF[T] input accepts a T output through the output's cast
            // view.
            if let Some(inner) = schema.deref_inner() {
                if match_schemas(inner, &out_schema) == SchemaMatch::Peer {
                    let cast = arena.cast_to_ref(output);
                    return Ok(InputBinding::Peer(cast));
                }
            }
            Err(EngineError::binding(format!(
                "cannot bind input of {schema} to output of {out_schema}"
            )))
        }
    }
}

fn release_ref_observers(
    arena: &mut TsArena,
    node: NodeId,
    input_index: u16,
    path: &mut ChildPath,
    binding: &InputBinding,
) {
    match binding {
        InputBinding::Unbound | InputBinding::Peer(_) => {}
        InputBinding::Deref { ref_output, .. } => {
            arena.remove_ref_observer(
                *ref_output,
                &RefObserver {
                    node,
                    input: input_index,
                    path: path.clone(),
                },
            );
        }
        InputBinding::Composite { children } => {
            for (i, child) in children.iter().enumerate() {
                path.push(i as u16);
                release_ref_observers(arena, node, input_index, path, child);
                path.pop();
            }
        }
    }
}

pub(crate) fn subscribe_binding(arena: &mut TsArena, node: NodeId, binding: &InputBinding) {
    match binding {
        InputBinding::Unbound => {}
        InputBinding::Peer(ts) => arena.subscribe(*ts, node),
        InputBinding::Deref { ref_output, target } => {
            arena.subscribe(*ref_output, node);
            if let Some(target) = target {
                arena.subscribe(*target, node);
            }
        }
        InputBinding::Composite { children } => {
            for child in children {
                subscribe_binding(arena, node, child);
            }
        }
    }
}

pub(crate) fn unsubscribe_binding(arena: &mut TsArena, node: NodeId, binding: &InputBinding) {
    match binding {
        InputBinding::Unbound => {}
        InputBinding::Peer(ts) => arena.unsubscribe(*ts, node),
        InputBinding::Deref { ref_output, target } => {
            arena.unsubscribe(*ref_output, node);
            if let Some(target) = target {
                arena.unsubscribe(*target, node);
            }
        }
        InputBinding::Composite { children } => {
            for child in children {
                unsubscribe_binding(arena, node, child);
            }
        }
    }
}

/* ───────────────────── queries ───────────────────── */

pub fn binding_valid(arena: &TsArena, binding: &InputBinding) -> bool {
    match binding {
        InputBinding::Unbound => false,
        InputBinding::Peer(ts) => arena.valid(*ts),
        InputBinding::Deref { target, .. } => target.is_some_and(|t| arena.valid(t)),
        InputBinding::Composite { children } => {
            children.iter().any(|c| binding_valid(arena, c))
        }
    }
}

pub fn binding_all_valid(arena: &TsArena, binding: &InputBinding) -> bool {
    match binding {
        InputBinding::Unbound => false,
        InputBinding::Peer(ts) => arena.all_valid(*ts),
        InputBinding::Deref { target, .. } => target.is_some_and(|t| arena.all_valid(t)),
        InputBinding::Composite { children } => {
            !children.is_empty() && children.iter().all(|c| binding_all_valid(arena, c))
        }
    }
}

pub fn binding_modified(arena: &TsArena, binding: &InputBinding, time: EngineTime) -> bool {
    match binding {
        InputBinding::Unbound => false,
        InputBinding::Peer(ts) => arena.modified_at(*ts, time),
        InputBinding::Deref { ref_output, target } => {
            arena.modified_at(*ref_output, time)
                || target.is_some_and(|t| arena.modified_at(t, time))
        }
        InputBinding::Composite { children } => {
            children.iter().any(|c| binding_modified(arena, c, time))
        }
    }
}

pub fn binding_last_modified(arena: &TsArena, binding: &InputBinding) -> EngineTime {
    match binding {
        InputBinding::Unbound => MIN_TIME,
        InputBinding::Peer(ts) => arena.last_modified(*ts),
        InputBinding::Deref { ref_output, target } => arena
            .last_modified(*ref_output)
            .max(target.map(|t| arena.last_modified(t)).unwrap_or(MIN_TIME)),
        InputBinding::Composite { children } => children
            .iter()
            .map(|c| binding_last_modified(arena, c))
            .max()
            .unwrap_or(MIN_TIME),
    }
}

/// The slot this binding reads through, when it resolves to a single one.
pub fn binding_resolved(binding: &InputBinding) -> Option<TsId> {
    match binding {
        InputBinding::Unbound | InputBinding::Composite { .. } => None,
        InputBinding::Peer(ts) => Some(*ts),
        InputBinding::Deref { target, .. } => *target,
    }
}

/// Render the slot at `id` viewed as `schema`, following references
/// transparently wherever the schema expects the referenced shape rather
/// than the reference itself.
pub fn plain_deref(arena: &TsArena, id: TsId, schema: &Schema) -> crate::ts::PlainValue {
    use crate::ts::{PlainValue, TsData};

    let id = if schema.is_ref() {
        id
    } else {
        reference::deref_ts(arena, id)
    };
    let slot = arena.slot(id);
    match (schema.kind(), &slot.data) {
        (TsKind::Scalar(_), TsData::Scalar(v)) => match v {
            Some(v) => PlainValue::Scalar(v.clone()),
            None => PlainValue::Empty,
        },
        (TsKind::Bundle(fields), TsData::Bundle(children)) => PlainValue::Bundle(
            fields
                .iter()
                .zip(children)
                .map(|((_, child_schema), &child)| plain_deref(arena, child, child_schema))
                .collect(),
        ),
        (TsKind::List { elem, .. } | TsKind::DynList { elem }, TsData::List(children)) => {
            PlainValue::List(
                children
                    .iter()
                    .map(|&child| plain_deref(arena, child, elem))
                    .collect(),
            )
        }
        (TsKind::Map { value, .. }, TsData::Map(_)) => PlainValue::Map(
            arena
                .map_entries(id)
                .into_iter()
                .map(|(k, child)| (k, plain_deref(arena, child, value)))
                .collect(),
        ),
        // Sets, windows, refs, and shape fallbacks render as stored.
        _ => arena.to_plain(id),
    }
}

/// Render an input binding as a plain value of the input's schema.
pub fn binding_plain(
    arena: &TsArena,
    binding: &InputBinding,
    schema: &Schema,
) -> crate::ts::PlainValue {
    use crate::ts::PlainValue;

    match binding {
        InputBinding::Unbound => PlainValue::Empty,
        InputBinding::Peer(ts) => plain_deref(arena, *ts, schema),
        InputBinding::Deref { target, .. } => match target {
            Some(target) => plain_deref(arena, *target, schema),
            None => PlainValue::Empty,
        },
        InputBinding::Composite { children } => {
            let rendered: Vec<crate::ts::PlainValue> = children
                .iter()
                .enumerate()
                .map(|(i, child)| match schema.child(i) {
                    Some(child_schema) => binding_plain(arena, child, child_schema),
                    None => PlainValue::Empty,
                })
                .collect();
            match schema.kind() {
                TsKind::List { .. } | TsKind::DynList { .. } => PlainValue::List(rendered),
                _ => PlainValue::Bundle(rendered),
            }
        }
    }
}

/// Navigate a composite binding to the child at `path`.
pub fn binding_at_path<'a>(binding: &'a InputBinding, path: &[u16]) -> Option<&'a InputBinding> {
    let mut cur = binding;
    for &step in path {
        match cur {
            InputBinding::Composite { children } => {
                cur = children.get(step as usize)?;
            }
            _ => return None,
        }
    }
    Some(cur)
}

pub(crate) fn binding_at_path_mut<'a>(
    binding: &'a mut InputBinding,
    path: &[u16],
) -> Option<&'a mut InputBinding> {
    let mut cur = binding;
    for &step in path {
        match cur {
            InputBinding::Composite { children } => {
                cur = children.get_mut(step as usize)?;
            }
            _ => return None,
        }
    }
    Some(cur)
}
