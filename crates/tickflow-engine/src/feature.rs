//! Feature outputs: derived time-series synthesized from container state.
//!
//! A map output can hand out three kinds of derived outputs: an
//! always-current reference to the entry for a key (`get_ref`), a bool
//! tracking key membership (`contains`), and a bool that ticks on
//! empty↔non-empty transitions (`is_empty`). The keyed features are
//! refcounted by `(key, requester)`: the first request materializes the
//! output, later requests share it, and the last release frees it. The
//! refcount table is explicit — feature lifetime is never tied to host
//! ownership.
//!
//! Feature values are maintained synchronously by the map mutation paths in
//! the arena, so observers of a feature see the new state in the same tick
//! the source map changed.

use crate::ts::arena::{Effects, TsArena, TsId};
use crate::ts::data::{OutputId, RefValue, TsData};
use crate::ts::map::FeatureEntry;
use crate::schema::TsSchema;
use tickflow_common::{EngineError, EngineTime, ScalarType, ScalarValue};

/// Identity of a feature requester. Node indices, host handles, and test
/// probes all reduce to an opaque id.
pub type RequesterId = u64;

impl TsArena {
    /// A `REF[V]` output tracking the map's entry for `key`. Empty while the
    /// key is absent; retargeted whenever the key appears, disappears, or is
    /// replaced.
    pub fn map_get_ref(
        &mut self,
        map_id: TsId,
        key: &ScalarValue,
        requester: RequesterId,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<TsId, EngineError> {
        if let Some(entry) = self.map_storage_mut(map_id).features.get_refs.get_mut(key) {
            entry.acquire(requester);
            return Ok(entry.ts);
        }

        let value_schema = self.map_value_schema(map_id);
        let owner = self.slot(map_id).owner;
        let ordinal = self.next_feature_ordinal();
        let ts = self.alloc_value(
            &TsSchema::reference(value_schema),
            owner,
            OutputId::Feature(ordinal),
            None,
        );
        let initial = match self.map_get(map_id, key) {
            Some(child) => RefValue::Bound(child),
            None => RefValue::Empty,
        };
        self.set_ref(ts, initial, time, fx);

        let mut entry = FeatureEntry::new(ts);
        entry.acquire(requester);
        self.insert_feature_entry_get_ref(map_id, key.clone(), entry);
        Ok(ts)
    }

    /// Release one `get_ref` hold; the output is freed when no requester
    /// remains.
    pub fn map_release_get_ref(
        &mut self,
        map_id: TsId,
        key: &ScalarValue,
        requester: RequesterId,
    ) {
        let features = &mut self.map_storage_mut(map_id).features;
        let Some(entry) = features.get_refs.get_mut(key) else {
            return;
        };
        if entry.release(requester) {
            let ts = entry.ts;
            features.get_refs.remove(key);
            self.free_subtree(ts);
        }
    }

    /// A bool output tracking membership of `key`.
    pub fn map_contains(
        &mut self,
        map_id: TsId,
        key: &ScalarValue,
        requester: RequesterId,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<TsId, EngineError> {
        if let Some(entry) = self.map_storage_mut(map_id).features.contains.get_mut(key) {
            entry.acquire(requester);
            return Ok(entry.ts);
        }

        let owner = self.slot(map_id).owner;
        let ordinal = self.next_feature_ordinal();
        let ts = self.alloc_value(
            &TsSchema::scalar(ScalarType::Bool),
            owner,
            OutputId::Feature(ordinal),
            None,
        );
        let present = self.map_contains_key(map_id, key);
        self.set_scalar(ts, ScalarValue::Bool(present), time, fx)?;

        let mut entry = FeatureEntry::new(ts);
        entry.acquire(requester);
        self.insert_feature_entry_contains(map_id, key.clone(), entry);
        Ok(ts)
    }

    /// Release one `contains` hold; the output is freed when no requester
    /// remains.
    pub fn map_release_contains(
        &mut self,
        map_id: TsId,
        key: &ScalarValue,
        requester: RequesterId,
    ) {
        let features = &mut self.map_storage_mut(map_id).features;
        let Some(entry) = features.contains.get_mut(key) else {
            return;
        };
        if entry.release(requester) {
            let ts = entry.ts;
            features.contains.remove(key);
            self.free_subtree(ts);
        }
    }

    /// A bool output that ticks only when the map transitions between empty
    /// and non-empty. One per map, allocated on first request.
    pub fn map_is_empty(
        &mut self,
        map_id: TsId,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<TsId, EngineError> {
        if let Some(ts) = self.map_storage(map_id).features.is_empty {
            return Ok(ts);
        }
        let owner = self.slot(map_id).owner;
        let ordinal = self.next_feature_ordinal();
        let ts = self.alloc_value(
            &TsSchema::scalar(ScalarType::Bool),
            owner,
            OutputId::Feature(ordinal),
            None,
        );
        let empty = self.map_len(map_id) == 0;
        self.map_storage_mut(map_id).is_empty_state = empty;
        self.set_scalar(ts, ScalarValue::Bool(empty), time, fx)?;
        self.map_storage_mut(map_id).features.is_empty = Some(ts);
        Ok(ts)
    }

    /// Number of live requesters on a keyed feature (diagnostics).
    pub fn map_get_ref_holds(&self, map_id: TsId, key: &ScalarValue) -> usize {
        match &self.slot(map_id).data {
            TsData::Map(map) => map
                .features
                .get_refs
                .get(key)
                .map(|e| e.refcounts.values().sum())
                .unwrap_or(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickflow_common::EngineTime;

    fn t(us: i64) -> EngineTime {
        EngineTime::from_micros(us)
    }

    fn map_arena() -> (TsArena, TsId) {
        let mut arena = TsArena::new();
        let schema = TsSchema::map(ScalarType::Str, TsSchema::scalar(ScalarType::Int));
        let id = arena.alloc_value(&schema, None, OutputId::Main, None);
        (arena, id)
    }

    #[test]
    fn get_ref_tracks_key_lifecycle() {
        let (mut arena, map) = map_arena();
        let mut fx = Effects::default();

        let r = arena.map_get_ref(map, &"k".into(), 1, t(1), &mut fx).unwrap();
        assert!(arena.ref_value(r).is_empty());

        let child = arena.map_get_or_create(map, &"k".into(), t(2), &mut fx).unwrap();
        assert_eq!(arena.ref_value(r).target(), Some(child));
        assert!(arena.modified_at(r, t(2)));

        arena.map_remove(map, &"k".into(), t(3), &mut fx).unwrap();
        assert!(arena.ref_value(r).is_empty());
        assert!(arena.modified_at(r, t(3)));
    }

    #[test]
    fn features_are_refcounted_by_requester() {
        let (mut arena, map) = map_arena();
        let mut fx = Effects::default();

        let r1 = arena.map_get_ref(map, &"k".into(), 1, t(1), &mut fx).unwrap();
        let r2 = arena.map_get_ref(map, &"k".into(), 2, t(1), &mut fx).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(arena.map_get_ref_holds(map, &"k".into()), 2);

        arena.map_release_get_ref(map, &"k".into(), 1);
        assert!(arena.contains(r1));
        arena.map_release_get_ref(map, &"k".into(), 2);
        assert!(!arena.contains(r1));
    }

    #[test]
    fn contains_feature_follows_membership() {
        let (mut arena, map) = map_arena();
        let mut fx = Effects::default();

        let c = arena.map_contains(map, &"k".into(), 1, t(1), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(c), Some(ScalarValue::Bool(false)));

        arena.map_get_or_create(map, &"k".into(), t(2), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(c), Some(ScalarValue::Bool(true)));
        assert!(arena.modified_at(c, t(2)));

        arena.map_remove(map, &"k".into(), t(3), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(c), Some(ScalarValue::Bool(false)));
    }

    #[test]
    fn is_empty_ticks_only_on_transitions() {
        let (mut arena, map) = map_arena();
        let mut fx = Effects::default();

        let e = arena.map_is_empty(map, t(1), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(e), Some(ScalarValue::Bool(true)));

        arena.map_get_or_create(map, &"a".into(), t(2), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(e), Some(ScalarValue::Bool(false)));
        assert!(arena.modified_at(e, t(2)));

        // Second key: no transition, the feature does not tick.
        arena.map_get_or_create(map, &"b".into(), t(3), &mut fx).unwrap();
        assert!(arena.modified_at(e, t(2)));

        arena.map_remove(map, &"a".into(), t(4), &mut fx).unwrap();
        assert!(arena.modified_at(e, t(2)));
        arena.map_remove(map, &"b".into(), t(5), &mut fx).unwrap();
        assert_eq!(arena.scalar_value(e), Some(ScalarValue::Bool(true)));
        assert!(arena.modified_at(e, t(5)));
    }
}
