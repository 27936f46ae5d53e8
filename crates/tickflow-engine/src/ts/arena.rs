//! The time-series arena: every addressable time-series position (outputs,
//! their children, feature outputs, cast views) is one slot holding storage
//! and its overlay state together.
//!
//! Overlay state per slot: the last-modified timestamp, the parent link for
//! upward propagation, the (lazily grown) observer list, and — inside the
//! set/map stores — the delta buffers. Peering is slot sharing: a peered
//! input holds the output's `TsId`, which makes the storage-pointer-equality
//! invariant structural.
//!
//! Mutations report their consequences as [`Effects`] instead of calling
//! back into the graph: node notifications to schedule, and reference
//! rebinds to process. The caller drains effects synchronously after each
//! write, so rebind visibility is within the writer's own call.

use crate::node::NodeId;
use crate::schema::{Schema, TsKind, TsSchema};
use smallvec::SmallVec;
use tickflow_common::{EngineError, EngineTime, MIN_TIME, ScalarValue};

use super::data::{OutputId, RefValue, TsData};
use super::map::{FeatureEntry, MapStorage, RemovedEntry};
use super::set::{SetMutation, SetStorage};
use super::window::WindowStorage;

/// Index of a time-series slot in the arena.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TsId(u32);

impl TsId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Path from an input root to the child link that observes a reference
/// output; rebinds address the link through it.
pub type ChildPath = SmallVec<[u16; 4]>;

/// A registered reference observer: the input link at `(node, input, path)`
/// follows the Ref output it is registered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefObserver {
    pub node: NodeId,
    pub input: u16,
    pub path: ChildPath,
}

/// A pending rebind produced by writing a reference output.
#[derive(Debug, Clone)]
pub struct RebindRequest {
    pub observer: RefObserver,
    pub ref_output: TsId,
}

/// Consequences of a write, drained synchronously by the caller.
#[derive(Debug, Default)]
pub struct Effects {
    pub notify: Vec<(NodeId, EngineTime)>,
    pub rebinds: Vec<RebindRequest>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.notify.is_empty() && self.rebinds.is_empty()
    }
}

#[derive(Debug)]
pub struct TsSlot {
    pub schema: Schema,
    pub data: TsData,
    pub last_modified: EngineTime,
    pub parent: Option<TsId>,
    pub owner: Option<NodeId>,
    pub output_id: OutputId,
    /// Node subscriptions; empty until the first subscriber (inline storage,
    /// no heap for the common unobserved case).
    pub observers: SmallVec<[NodeId; 2]>,
    /// Input links following this slot as a reference output.
    pub ref_observers: Vec<RefObserver>,
    /// Lazily materialized cast views of this output, by target schema.
    casts: Option<Box<Vec<(Schema, TsId)>>>,
}

#[derive(Debug, Default)]
pub struct TsArena {
    slots: Vec<Option<TsSlot>>,
    free: Vec<u32>,
    feature_ordinal: u32,
}

impl TsArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn slot(&self, id: TsId) -> &TsSlot {
        self.slots[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("use of freed time-series slot {}", id.raw()))
    }

    #[inline]
    pub fn slot_mut(&mut self, id: TsId) -> &mut TsSlot {
        self.slots[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("use of freed time-series slot {}", id.raw()))
    }

    pub fn contains(&self, id: TsId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|s| s.is_some())
    }

    fn insert_slot(&mut self, slot: TsSlot) -> TsId {
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(slot);
                TsId(i)
            }
            None => {
                self.slots.push(Some(slot));
                TsId(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Allocate storage for `schema`, recursively materializing statically
    /// addressable children (bundle fields, fixed-list slots). Dynamic
    /// containers start empty; references start `Empty`.
    pub fn alloc_value(
        &mut self,
        schema: &Schema,
        owner: Option<NodeId>,
        output_id: OutputId,
        parent: Option<TsId>,
    ) -> TsId {
        let data = match schema.kind() {
            TsKind::Scalar(_) => TsData::Scalar(None),
            TsKind::Bundle(_) => TsData::Bundle(SmallVec::new()),
            TsKind::List { .. } => TsData::List(Vec::new()),
            TsKind::DynList { .. } => TsData::List(Vec::new()),
            TsKind::Set { .. } => TsData::Set(SetStorage::new()),
            TsKind::Map { .. } => TsData::Map(MapStorage::new()),
            TsKind::Window { spec, .. } => TsData::Window(WindowStorage::new(*spec)),
            TsKind::Ref { .. } => TsData::Ref(RefValue::Empty),
        };
        let id = self.insert_slot(TsSlot {
            schema: schema.clone(),
            data,
            last_modified: MIN_TIME,
            parent,
            owner,
            output_id,
            observers: SmallVec::new(),
            ref_observers: Vec::new(),
            casts: None,
        });

        match schema.kind() {
            TsKind::Bundle(fields) => {
                let children: SmallVec<[TsId; 4]> = fields
                    .iter()
                    .map(|(_, child)| self.alloc_value(child, owner, output_id, Some(id)))
                    .collect();
                if let TsData::Bundle(slots) = &mut self.slot_mut(id).data {
                    *slots = children;
                }
            }
            TsKind::List { elem, len } => {
                let children: Vec<TsId> = (0..*len)
                    .map(|_| self.alloc_value(elem, owner, output_id, Some(id)))
                    .collect();
                if let TsData::List(slots) = &mut self.slot_mut(id).data {
                    *slots = children;
                }
            }
            _ => {}
        }
        id
    }

    /// Free a slot and everything it owns: children, buffered removed map
    /// entries, feature outputs, cast views.
    pub fn free_subtree(&mut self, id: TsId) {
        let Some(slot) = self.slots[id.index()].take() else {
            return;
        };
        self.free.push(id.raw());

        if let Some(casts) = slot.casts {
            for (_, cast) in casts.iter() {
                self.free_subtree(*cast);
            }
        }
        match slot.data {
            TsData::Bundle(children) => {
                for c in children {
                    self.free_subtree(c);
                }
            }
            TsData::List(children) => {
                for c in children {
                    self.free_subtree(c);
                }
            }
            TsData::Map(map) => {
                for (_, child) in map.entries() {
                    self.free_subtree(child);
                }
                for child in &map.delta.removed_entries {
                    self.free_subtree(*child);
                }
                for entry in map.features.get_refs.values() {
                    self.free_subtree(entry.ts);
                }
                for entry in map.features.contains.values() {
                    self.free_subtree(entry.ts);
                }
                if let Some(is_empty) = map.features.is_empty {
                    self.free_subtree(is_empty);
                }
            }
            _ => {}
        }
    }

    /* ───────────────────── overlay queries ───────────────────── */

    #[inline]
    pub fn last_modified(&self, id: TsId) -> EngineTime {
        self.slot(id).last_modified
    }

    #[inline]
    pub fn valid(&self, id: TsId) -> bool {
        self.slot(id).last_modified > MIN_TIME
    }

    #[inline]
    pub fn modified_at(&self, id: TsId, time: EngineTime) -> bool {
        self.slot(id).last_modified == time
    }

    /// Every leaf in the subtree is valid.
    pub fn all_valid(&self, id: TsId) -> bool {
        let slot = self.slot(id);
        match &slot.data {
            TsData::Scalar(_) | TsData::Set(_) | TsData::Window(_) | TsData::Ref(_) => {
                slot.last_modified > MIN_TIME
            }
            TsData::Bundle(children) => children.iter().all(|&c| self.all_valid(c)),
            TsData::List(children) => children.iter().all(|&c| self.all_valid(c)),
            TsData::Map(map) => {
                slot.last_modified > MIN_TIME
                    && map.entries().all(|(_, child)| self.all_valid(child))
            }
        }
    }

    /// Children (bundle fields / list slots) modified exactly at `time`.
    pub fn modified_indices(&self, id: TsId, time: EngineTime) -> Vec<usize> {
        match &self.slot(id).data {
            TsData::Bundle(children) => children
                .iter()
                .enumerate()
                .filter(|&(_, &c)| self.modified_at(c, time))
                .map(|(i, _)| i)
                .collect(),
            TsData::List(children) => children
                .iter()
                .enumerate()
                .filter(|&(_, &c)| self.modified_at(c, time))
                .map(|(i, _)| i)
                .collect(),
            _ => Vec::new(),
        }
    }

    /* ───────────────────── overlay mutation ───────────────────── */

    /// Update the slot's timestamp and propagate upward, collecting node
    /// notifications along the chain. Stale times (earlier than the current
    /// timestamp) are ignored; an ancestor already at `time` terminates the
    /// walk (its observers were notified when it reached `time`).
    pub fn mark_modified(&mut self, id: TsId, time: EngineTime, fx: &mut Effects) {
        let slot = self.slot_mut(id);
        if time < slot.last_modified {
            return;
        }
        slot.last_modified = time;
        for &n in &slot.observers {
            fx.notify.push((n, time));
        }
        let mut cur = slot.parent;
        while let Some(c) = cur {
            let slot = self.slot_mut(c);
            if slot.last_modified >= time {
                break;
            }
            slot.last_modified = time;
            for &n in &slot.observers {
                fx.notify.push((n, time));
            }
            cur = slot.parent;
        }
    }

    /// Reset the slot's own timestamp to "never"; parents are untouched
    /// (invalidation is local). Delta buffers are dropped and cast views
    /// synthesized from this slot are invalidated and discarded.
    pub fn mark_invalid(&mut self, id: TsId) {
        let slot = self.slot_mut(id);
        slot.last_modified = MIN_TIME;
        match &mut slot.data {
            TsData::Set(set) => set.delta.clear(),
            TsData::Map(map) => {
                let freed = map.delta.drain();
                map.delta.last_delta_time = MIN_TIME;
                let casts = slot.casts.take();
                for child in freed {
                    self.free_subtree(child);
                }
                if let Some(casts) = casts {
                    for (_, cast) in casts.iter() {
                        self.free_subtree(*cast);
                    }
                }
                return;
            }
            _ => {}
        }
        if let Some(casts) = self.slot_mut(id).casts.take() {
            for (_, cast) in casts.iter() {
                self.free_subtree(*cast);
            }
        }
    }

    pub fn subscribe(&mut self, id: TsId, node: NodeId) {
        let slot = self.slot_mut(id);
        if !slot.observers.contains(&node) {
            slot.observers.push(node);
        }
    }

    pub fn unsubscribe(&mut self, id: TsId, node: NodeId) {
        let slot = self.slot_mut(id);
        if let Some(pos) = slot.observers.iter().position(|&n| n == node) {
            slot.observers.swap_remove(pos);
        }
    }

    pub fn is_subscribed(&self, id: TsId, node: NodeId) -> bool {
        self.slot(id).observers.contains(&node)
    }

    pub fn add_ref_observer(&mut self, id: TsId, observer: RefObserver) {
        let slot = self.slot_mut(id);
        if !slot.ref_observers.contains(&observer) {
            slot.ref_observers.push(observer);
        }
    }

    pub fn remove_ref_observer(&mut self, id: TsId, observer: &RefObserver) {
        let slot = self.slot_mut(id);
        slot.ref_observers.retain(|o| o != observer);
    }

    /* ───────────────────── scalar ───────────────────── */

    pub fn set_scalar(
        &mut self,
        id: TsId,
        value: ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<(), EngineError> {
        let slot = self.slot_mut(id);
        match (slot.schema.as_scalar(), &mut slot.data) {
            (Some(ty), TsData::Scalar(stored)) => {
                if !value.matches_type(ty) {
                    return Err(EngineError::binding(format!(
                        "scalar of type {} written to {}",
                        value.scalar_type(),
                        slot.schema
                    )));
                }
                *stored = Some(value);
            }
            _ => {
                return Err(EngineError::binding(format!(
                    "scalar write to non-scalar {}",
                    slot.schema
                )));
            }
        }
        self.mark_modified(id, time, fx);
        Ok(())
    }

    pub fn scalar_value(&self, id: TsId) -> Option<ScalarValue> {
        match &self.slot(id).data {
            TsData::Scalar(v) => v.clone(),
            _ => None,
        }
    }

    /* ───────────────────── bundle / list ───────────────────── */

    pub fn child_at(&self, id: TsId, index: usize) -> Option<TsId> {
        match &self.slot(id).data {
            TsData::Bundle(children) => children.get(index).copied(),
            TsData::List(children) => children.get(index).copied(),
            _ => None,
        }
    }

    pub fn child_by_name(&self, id: TsId, name: &str) -> Option<TsId> {
        let index = self.slot(id).schema.field_index(name)?;
        self.child_at(id, index)
    }

    pub fn child_count(&self, id: TsId) -> usize {
        match &self.slot(id).data {
            TsData::Bundle(children) => children.len(),
            TsData::List(children) => children.len(),
            _ => 0,
        }
    }

    /// Append an element slot to a dynamic list.
    pub fn dyn_list_push(&mut self, id: TsId, time: EngineTime, fx: &mut Effects) -> TsId {
        let elem_schema = match self.slot(id).schema.kind() {
            TsKind::DynList { elem } => elem.clone(),
            other => panic!("dyn_list_push on {other:?}"),
        };
        let (owner, output_id) = {
            let slot = self.slot(id);
            (slot.owner, slot.output_id)
        };
        let child = self.alloc_value(&elem_schema, owner, output_id, Some(id));
        if let TsData::List(children) = &mut self.slot_mut(id).data {
            children.push(child);
        }
        self.mark_modified(id, time, fx);
        child
    }

    /// Drop the trailing element of a dynamic list.
    pub fn dyn_list_pop(&mut self, id: TsId, time: EngineTime, fx: &mut Effects) -> bool {
        let popped = match &mut self.slot_mut(id).data {
            TsData::List(children) => children.pop(),
            _ => None,
        };
        match popped {
            Some(child) => {
                self.free_subtree(child);
                self.mark_modified(id, time, fx);
                true
            }
            None => false,
        }
    }

    /* ───────────────────── set ───────────────────── */

    fn set_storage(&self, id: TsId) -> &SetStorage {
        match &self.slot(id).data {
            TsData::Set(set) => set,
            other => panic!("set access on {}", other.kind_name()),
        }
    }

    fn set_storage_mut(&mut self, id: TsId) -> &mut SetStorage {
        match &mut self.slot_mut(id).data {
            TsData::Set(set) => set,
            other => panic!("set access on {}", other.kind_name()),
        }
    }

    pub fn set_add(
        &mut self,
        id: TsId,
        value: ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> bool {
        let last = self.last_modified(id);
        let changed = self.set_storage_mut(id).insert(value, last, time);
        if changed == SetMutation::Changed {
            self.mark_modified(id, time, fx);
        }
        changed == SetMutation::Changed
    }

    pub fn set_remove(
        &mut self,
        id: TsId,
        value: &ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> bool {
        let last = self.last_modified(id);
        let changed = self.set_storage_mut(id).remove(value, last, time);
        if changed == SetMutation::Changed {
            self.mark_modified(id, time, fx);
        }
        changed == SetMutation::Changed
    }

    /// Clear the set. An already-empty set is still marked modified.
    pub fn set_clear(&mut self, id: TsId, time: EngineTime, fx: &mut Effects) {
        let last = self.last_modified(id);
        self.set_storage_mut(id).clear(last, time);
        self.mark_modified(id, time, fx);
    }

    pub fn set_contains(&self, id: TsId, value: &ScalarValue) -> bool {
        self.set_storage(id).contains(value)
    }

    pub fn set_len(&self, id: TsId) -> usize {
        self.set_storage(id).len()
    }

    pub fn set_snapshot(&self, id: TsId) -> Vec<ScalarValue> {
        self.set_storage(id).snapshot()
    }

    /// Lazy-cleanup delta query: asking at a different time than the last
    /// recording clears the buffers and reports no delta.
    pub fn set_has_delta_at(&mut self, id: TsId, time: EngineTime) -> bool {
        let last = self.last_modified(id);
        let set = self.set_storage_mut(id);
        if time != last {
            set.delta.clear();
            return false;
        }
        !set.delta.is_empty()
    }

    pub fn set_added_values(&self, id: TsId) -> Vec<ScalarValue> {
        self.set_storage(id).added_values()
    }

    pub fn set_removed_values(&self, id: TsId) -> Vec<ScalarValue> {
        self.set_storage(id).delta.removed_values.clone()
    }

    /* ───────────────────── window ───────────────────── */

    pub fn window_push(
        &mut self,
        id: TsId,
        value: ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<(), EngineError> {
        let slot = self.slot_mut(id);
        let elem = match slot.schema.kind() {
            TsKind::Window { elem, .. } => *elem,
            _ => {
                return Err(EngineError::binding(format!(
                    "window push to {}",
                    slot.schema
                )));
            }
        };
        if !value.matches_type(elem) {
            return Err(EngineError::binding(format!(
                "window element of type {} pushed to {}",
                value.scalar_type(),
                slot.schema
            )));
        }
        match &mut slot.data {
            TsData::Window(w) => w.push(time, value),
            other => panic!("window access on {}", other.kind_name()),
        }
        self.mark_modified(id, time, fx);
        Ok(())
    }

    pub fn window_snapshot(&self, id: TsId) -> Vec<(EngineTime, ScalarValue)> {
        match &self.slot(id).data {
            TsData::Window(w) => w.snapshot(),
            other => panic!("window access on {}", other.kind_name()),
        }
    }

    pub fn window_len(&self, id: TsId) -> usize {
        match &self.slot(id).data {
            TsData::Window(w) => w.len(),
            other => panic!("window access on {}", other.kind_name()),
        }
    }

    pub fn window_is_full(&self, id: TsId) -> bool {
        match &self.slot(id).data {
            TsData::Window(w) => w.is_full(),
            other => panic!("window access on {}", other.kind_name()),
        }
    }

    /* ───────────────────── ref ───────────────────── */

    pub fn ref_value(&self, id: TsId) -> RefValue {
        match &self.slot(id).data {
            TsData::Ref(v) => v.clone(),
            other => panic!("ref access on {}", other.kind_name()),
        }
    }

    /// Write a reference value. Every registered reference observer becomes a
    /// pending rebind; the caller processes them before returning to the
    /// writer, so retargeting is synchronous within the writing evaluation.
    pub fn set_ref(&mut self, id: TsId, value: RefValue, time: EngineTime, fx: &mut Effects) {
        {
            let slot = self.slot_mut(id);
            match &mut slot.data {
                // Re-pointing at the same target still ticks the ref.
                TsData::Ref(stored) => *stored = value,
                other => panic!("ref access on {}", other.kind_name()),
            }
            for observer in slot.ref_observers.clone() {
                fx.rebinds.push(RebindRequest {
                    observer,
                    ref_output: id,
                });
            }
        }
        self.mark_modified(id, time, fx);
    }

    /* ───────────────────── map ───────────────────── */

    pub(crate) fn map_storage(&self, id: TsId) -> &MapStorage {
        match &self.slot(id).data {
            TsData::Map(map) => map,
            other => panic!("map access on {}", other.kind_name()),
        }
    }

    pub(crate) fn map_storage_mut(&mut self, id: TsId) -> &mut MapStorage {
        match &mut self.slot_mut(id).data {
            TsData::Map(map) => map,
            other => panic!("map access on {}", other.kind_name()),
        }
    }

    pub fn map_value_schema(&self, id: TsId) -> Schema {
        match self.slot(id).schema.kind() {
            TsKind::Map { value, .. } => value.clone(),
            other => panic!("map access on {other:?}"),
        }
    }

    pub fn map_get(&self, id: TsId, key: &ScalarValue) -> Option<TsId> {
        self.map_storage(id).get(key)
    }

    pub fn map_contains_key(&self, id: TsId, key: &ScalarValue) -> bool {
        self.map_storage(id).contains_key(key)
    }

    pub fn map_len(&self, id: TsId) -> usize {
        self.map_storage(id).len()
    }

    pub fn map_keys(&self, id: TsId) -> Vec<ScalarValue> {
        self.map_storage(id).keys()
    }

    pub fn map_entries(&self, id: TsId) -> Vec<(ScalarValue, TsId)> {
        self.map_storage(id)
            .entries()
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }

    /// The entry's value slot, creating the entry (and recording a key
    /// addition) when absent. Feature outputs tracking this key are updated
    /// synchronously.
    pub fn map_get_or_create(
        &mut self,
        id: TsId,
        key: &ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<TsId, EngineError> {
        self.check_map_key(id, key)?;
        if let Some(existing) = self.map_storage(id).get(key) {
            return Ok(existing);
        }
        let freed = self.map_storage_mut(id).maybe_reset_delta(time);
        for child in freed {
            self.free_subtree(child);
        }

        let value_schema = self.map_value_schema(id);
        let (owner, output_id) = {
            let slot = self.slot(id);
            (slot.owner, slot.output_id)
        };
        let child = self.alloc_value(&value_schema, owner, output_id, Some(id));
        self.map_storage_mut(id).insert_entry(key.clone(), child);
        self.mark_modified(id, time, fx);
        self.sync_map_features_on_insert(id, key, child, time, fx);
        Ok(child)
    }

    /// Remove a key; the key and its value slot stay readable from the delta
    /// buffers until the next modification at a different time.
    pub fn map_remove(
        &mut self,
        id: TsId,
        key: &ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<bool, EngineError> {
        self.check_map_key(id, key)?;
        if !self.map_storage(id).contains_key(key) {
            return Ok(false);
        }
        let freed = self.map_storage_mut(id).maybe_reset_delta(time);
        for child in freed {
            self.free_subtree(child);
        }
        let removed: Option<RemovedEntry> = self.map_storage_mut(id).remove_entry(key);
        if let Some(removed) = removed {
            // Detach the buffered slot from the container so child-time
            // propagation no longer reaches it.
            if !removed.cancelled_add {
                self.slot_mut(removed.value).parent = None;
            } else {
                self.free_subtree(removed.value);
            }
            self.mark_modified(id, time, fx);
            self.sync_map_features_on_remove(id, key, time, fx);
        }
        Ok(true)
    }

    /// Remove every key. An already-empty map is still marked modified.
    pub fn map_clear(&mut self, id: TsId, time: EngineTime, fx: &mut Effects) {
        for key in self.map_keys(id) {
            // Keys were just listed; removal cannot fail on type.
            let _ = self.map_remove(id, &key, time, fx);
        }
        self.mark_modified(id, time, fx);
    }

    fn check_map_key(&self, id: TsId, key: &ScalarValue) -> Result<(), EngineError> {
        let key_type = match self.slot(id).schema.kind() {
            TsKind::Map { key, .. } => *key,
            _ => {
                return Err(EngineError::binding(format!(
                    "map access on {}",
                    self.slot(id).schema
                )));
            }
        };
        if !key.matches_type(key_type) {
            return Err(EngineError::binding(format!(
                "map key of type {} used with {}",
                key.scalar_type(),
                self.slot(id).schema
            )));
        }
        Ok(())
    }

    /// Lazy-cleanup structural delta query, keyed on the map's separate delta
    /// time (child value modifications are not structural).
    pub fn map_has_delta_at(&mut self, id: TsId, time: EngineTime) -> bool {
        let map = self.map_storage_mut(id);
        if time != map.delta.last_delta_time {
            let freed = map.delta.drain();
            map.delta.last_delta_time = MIN_TIME;
            for child in freed {
                self.free_subtree(child);
            }
            return false;
        }
        !self.map_storage(id).delta.is_empty()
    }

    pub fn map_added_keys(&self, id: TsId) -> Vec<ScalarValue> {
        self.map_storage(id).added_keys()
    }

    pub fn map_removed(&self, id: TsId) -> Vec<(ScalarValue, TsId)> {
        let map = self.map_storage(id);
        map.delta
            .removed_keys
            .iter()
            .cloned()
            .zip(map.delta.removed_entries.iter().copied())
            .collect()
    }

    pub fn map_modified_key_indices(&self, id: TsId, time: EngineTime) -> Vec<usize> {
        let map = self.map_storage(id);
        map.modified_key_indices(time, |child| self.last_modified(child))
    }

    pub fn map_key_at(&self, id: TsId, index: usize) -> Option<ScalarValue> {
        self.map_storage(id).key_at(index).cloned()
    }

    /* ───────── feature synchronization (map mutations) ───────── */

    fn sync_map_features_on_insert(
        &mut self,
        id: TsId,
        key: &ScalarValue,
        child: TsId,
        time: EngineTime,
        fx: &mut Effects,
    ) {
        let map = self.map_storage(id);
        let get_ref = map.features.get_refs.get(key).map(|e| e.ts);
        let contains = map.features.contains.get(key).map(|e| e.ts);
        let is_empty = map.features.is_empty;
        let became_nonempty = map.is_empty_state && map.len() > 0;

        if let Some(ref_ts) = get_ref {
            self.set_ref(ref_ts, RefValue::Bound(child), time, fx);
        }
        if let Some(contains_ts) = contains {
            // Errors are impossible: contains features are bool scalars.
            let _ = self.set_scalar(contains_ts, ScalarValue::Bool(true), time, fx);
        }
        if became_nonempty {
            self.map_storage_mut(id).is_empty_state = false;
            if let Some(is_empty_ts) = is_empty {
                let _ = self.set_scalar(is_empty_ts, ScalarValue::Bool(false), time, fx);
            }
        }
    }

    fn sync_map_features_on_remove(
        &mut self,
        id: TsId,
        key: &ScalarValue,
        time: EngineTime,
        fx: &mut Effects,
    ) {
        let map = self.map_storage(id);
        let get_ref = map.features.get_refs.get(key).map(|e| e.ts);
        let contains = map.features.contains.get(key).map(|e| e.ts);
        let is_empty = map.features.is_empty;
        let became_empty = !map.is_empty_state && map.len() == 0;

        if let Some(ref_ts) = get_ref {
            self.set_ref(ref_ts, RefValue::Empty, time, fx);
        }
        if let Some(contains_ts) = contains {
            let _ = self.set_scalar(contains_ts, ScalarValue::Bool(false), time, fx);
        }
        if became_empty {
            self.map_storage_mut(id).is_empty_state = true;
            if let Some(is_empty_ts) = is_empty {
                let _ = self.set_scalar(is_empty_ts, ScalarValue::Bool(true), time, fx);
            }
        }
    }

    pub(crate) fn next_feature_ordinal(&mut self) -> u32 {
        self.feature_ordinal += 1;
        self.feature_ordinal
    }

    pub(crate) fn insert_feature_entry_get_ref(
        &mut self,
        id: TsId,
        key: ScalarValue,
        entry: FeatureEntry,
    ) {
        self.map_storage_mut(id).features.get_refs.insert(key, entry);
    }

    pub(crate) fn insert_feature_entry_contains(
        &mut self,
        id: TsId,
        key: ScalarValue,
        entry: FeatureEntry,
    ) {
        self.map_storage_mut(id).features.contains.insert(key, entry);
    }

    /* ───────────────────── cast views ───────────────────── */

    /// View this output as `REF[self.schema]`, materializing and caching the
    /// cast on first request. The cast is an ordinary Ref slot bound to the
    /// source; invalidating the source discards it.
    pub fn cast_to_ref(&mut self, id: TsId) -> TsId {
        let source_schema = self.slot(id).schema.clone();
        let target = TsSchema::reference(source_schema);
        if let Some(casts) = &self.slot(id).casts {
            if let Some((_, cast)) = casts.iter().find(|(s, _)| TsSchema::same(s, &target)) {
                return *cast;
            }
        }
        let (owner, last_modified) = {
            let slot = self.slot(id);
            (slot.owner, slot.last_modified)
        };
        let cast = self.alloc_value(&target, owner, OutputId::Cast, None);
        {
            let slot = self.slot_mut(cast);
            slot.data = TsData::Ref(RefValue::Bound(id));
            slot.last_modified = last_modified;
        }
        self.slot_mut(id)
            .casts
            .get_or_insert_with(Default::default)
            .push((target, cast));
        // The ref carries a binding from birth; observers attaching later
        // pick the target up from the stored value, so no notification here.
        cast
    }
}
