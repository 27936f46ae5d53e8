//! Backing store for map-valued time-series (scalar key → time-series value).
//!
//! Key tracking mirrors the set store: stable slots, added/removed index
//! buffers, removed keys buffered until the next modification at a different
//! time. Removed *values* are detached arena slots that stay readable for the
//! remainder of the tick; the arena frees them on delta reset.
//!
//! The delta time is tracked separately from the overlay's modification time:
//! child value modifications propagate into the container's
//! `last_modified_time` without being structural changes.

use super::arena::TsId;
use rustc_hash::FxHashMap;
use tickflow_common::{EngineTime, MIN_TIME, ScalarValue};

#[derive(Debug)]
pub struct MapDelta {
    /// Time of the last structural (key add/remove) recording.
    pub last_delta_time: EngineTime,
    pub added_key_indices: Vec<usize>,
    pub removed_key_indices: Vec<usize>,
    pub removed_keys: Vec<ScalarValue>,
    /// Detached value slots for removed keys, 1:1 with `removed_key_indices`.
    pub removed_entries: Vec<TsId>,
}

impl Default for MapDelta {
    fn default() -> Self {
        Self::new()
    }
}

impl MapDelta {
    pub fn new() -> Self {
        Self {
            last_delta_time: MIN_TIME,
            added_key_indices: Vec::new(),
            removed_key_indices: Vec::new(),
            removed_keys: Vec::new(),
            removed_entries: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added_key_indices.is_empty() && self.removed_key_indices.is_empty()
    }

    /// Clear buffers, handing back the detached value slots for the arena to
    /// free.
    pub fn drain(&mut self) -> Vec<TsId> {
        self.added_key_indices.clear();
        self.removed_key_indices.clear();
        self.removed_keys.clear();
        std::mem::take(&mut self.removed_entries)
    }
}

/// Refcounted feature output: one derived TS output shared by all requesters
/// of the same key.
#[derive(Debug)]
pub struct FeatureEntry {
    pub ts: TsId,
    pub refcounts: FxHashMap<u64, usize>,
}

impl FeatureEntry {
    pub fn new(ts: TsId) -> Self {
        Self {
            ts,
            refcounts: FxHashMap::default(),
        }
    }

    pub fn acquire(&mut self, requester: u64) {
        *self.refcounts.entry(requester).or_insert(0) += 1;
    }

    /// Returns true when no requester holds the feature any more.
    pub fn release(&mut self, requester: u64) -> bool {
        if let Some(count) = self.refcounts.get_mut(&requester) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&requester);
            }
        }
        self.refcounts.is_empty()
    }
}

/// Derived outputs synthesized from container state, keyed by requester.
#[derive(Debug, Default)]
pub struct MapFeatures {
    pub get_refs: FxHashMap<ScalarValue, FeatureEntry>,
    pub contains: FxHashMap<ScalarValue, FeatureEntry>,
    pub is_empty: Option<TsId>,
}

#[derive(Debug)]
struct MapEntry {
    key: ScalarValue,
    value: TsId,
}

/// Outcome of a key removal.
#[derive(Debug, Clone, Copy)]
pub struct RemovedEntry {
    pub index: usize,
    /// The entry's value slot. Buffered in the delta unless `cancelled_add`,
    /// in which case the caller owns (and should free) it.
    pub value: TsId,
    pub cancelled_add: bool,
}

#[derive(Debug, Default)]
pub struct MapStorage {
    slots: Vec<Option<MapEntry>>,
    index_of: FxHashMap<ScalarValue, usize>,
    free: Vec<usize>,
    len: usize,
    pub delta: MapDelta,
    pub features: MapFeatures,
    /// Tracked empty-state; transitions mark the `is_empty` feature output.
    pub is_empty_state: bool,
}

impl MapStorage {
    pub fn new() -> Self {
        Self {
            delta: MapDelta::new(),
            is_empty_state: true,
            ..Default::default()
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn contains_key(&self, key: &ScalarValue) -> bool {
        self.index_of.contains_key(key)
    }

    pub fn get(&self, key: &ScalarValue) -> Option<TsId> {
        self.index_of
            .get(key)
            .and_then(|&i| self.slots[i].as_ref())
            .map(|e| e.value)
    }

    pub fn index_of_key(&self, key: &ScalarValue) -> Option<usize> {
        self.index_of.get(key).copied()
    }

    pub fn key_at(&self, index: usize) -> Option<&ScalarValue> {
        self.slots.get(index).and_then(|s| s.as_ref()).map(|e| &e.key)
    }

    pub fn value_at(&self, index: usize) -> Option<TsId> {
        self.slots.get(index).and_then(|s| s.as_ref()).map(|e| e.value)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ScalarValue, TsId)> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|e| (&e.key, e.value))
    }

    pub fn keys(&self) -> Vec<ScalarValue> {
        self.entries().map(|(k, _)| k.clone()).collect()
    }

    /// Entry indices currently occupied.
    pub fn occupied_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Reset delta buffers when writing at a new time; the returned slots are
    /// detached removed values the arena must free.
    pub fn maybe_reset_delta(&mut self, time: EngineTime) -> Vec<TsId> {
        if time != self.delta.last_delta_time && self.delta.last_delta_time != MIN_TIME {
            let freed = self.delta.drain();
            self.delta.last_delta_time = time;
            return freed;
        }
        self.delta.last_delta_time = time;
        Vec::new()
    }

    /// Insert a key with its (already allocated) value slot; records the key
    /// addition. Caller is responsible for `maybe_reset_delta` beforehand.
    pub fn insert_entry(&mut self, key: ScalarValue, value: TsId) -> usize {
        debug_assert!(!self.contains_key(&key));
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.index_of.insert(key.clone(), index);
        self.slots[index] = Some(MapEntry { key, value });
        self.len += 1;
        self.delta.added_key_indices.push(index);
        index
    }

    /// Remove a key, buffering its key value and detached value slot.
    /// Caller is responsible for `maybe_reset_delta` beforehand.
    pub fn remove_entry(&mut self, key: &ScalarValue) -> Option<RemovedEntry> {
        let index = self.index_of.remove(key)?;
        let entry = self.slots[index].take()?;
        self.free.push(index);
        self.len -= 1;

        // A key added earlier in the same tick and removed again retracts
        // the addition instead of recording a removal; the value slot is not
        // buffered and the caller should free it.
        if let Some(pos) = self
            .delta
            .added_key_indices
            .iter()
            .position(|&i| i == index)
        {
            self.delta.added_key_indices.remove(pos);
            return Some(RemovedEntry {
                index,
                value: entry.value,
                cancelled_add: true,
            });
        }

        self.delta.removed_key_indices.push(index);
        self.delta.removed_keys.push(entry.key);
        self.delta.removed_entries.push(entry.value);
        Some(RemovedEntry {
            index,
            value: entry.value,
            cancelled_add: false,
        })
    }

    /// Keys whose value slot ticked at `time` without being added at `time`.
    pub fn modified_key_indices(
        &self,
        time: EngineTime,
        child_time: impl Fn(TsId) -> EngineTime,
    ) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let entry = s.as_ref()?;
                if self.delta.added_key_indices.contains(&i) {
                    return None;
                }
                (child_time(entry.value) == time).then_some(i)
            })
            .collect()
    }

    pub fn added_keys(&self) -> Vec<ScalarValue> {
        self.delta
            .added_key_indices
            .iter()
            .filter_map(|&i| self.key_at(i).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(us: i64) -> EngineTime {
        EngineTime::from_micros(us)
    }

    #[test]
    fn insert_remove_buffer_keys_and_values() {
        let mut m = MapStorage::new();
        m.maybe_reset_delta(t(1));
        let i_a = m.insert_entry("a".into(), TsId::from_raw(100));
        let _ = m.insert_entry("b".into(), TsId::from_raw(101));
        assert_eq!(m.len(), 2);
        assert_eq!(m.delta.added_key_indices.len(), 2);

        let freed = m.maybe_reset_delta(t(2));
        assert!(freed.is_empty());
        let removed = m.remove_entry(&"a".into()).unwrap();
        assert_eq!(removed.index, i_a);
        assert_eq!(removed.value, TsId::from_raw(100));
        assert!(!removed.cancelled_add);
        assert_eq!(m.delta.removed_keys, vec![ScalarValue::from("a")]);
        assert_eq!(m.delta.removed_entries, vec![TsId::from_raw(100)]);
        assert!(!m.contains_key(&"a".into()));

        // Next different-time write frees the detached slot.
        let freed = m.maybe_reset_delta(t(3));
        assert_eq!(freed, vec![TsId::from_raw(100)]);
    }

    #[test]
    fn same_tick_add_remove_cancels() {
        let mut m = MapStorage::new();
        m.maybe_reset_delta(t(1));
        m.insert_entry("k".into(), TsId::from_raw(7));
        m.remove_entry(&"k".into()).unwrap();
        assert!(m.delta.is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn modified_excludes_added() {
        let mut m = MapStorage::new();
        m.maybe_reset_delta(t(5));
        m.insert_entry("old".into(), TsId::from_raw(1));
        let freed = m.maybe_reset_delta(t(6));
        assert!(freed.is_empty());
        m.insert_entry("new".into(), TsId::from_raw(2));

        // Both children ticked at t6; only the pre-existing key is
        // "modified", the other is "added".
        let modified = m.modified_key_indices(t(6), |_| t(6));
        let added: Vec<usize> = m.delta.added_key_indices.clone();
        assert_eq!(modified.len(), 1);
        assert_eq!(added.len(), 1);
        assert_ne!(modified[0], added[0]);
    }
}
