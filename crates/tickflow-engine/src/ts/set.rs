//! Backing store for set-valued time-series.
//!
//! Elements live in stable slots so delta buffers can refer to them by index
//! across the tick that removed them. Removed values are buffered until the
//! next modification at a different time (lazy cleanup), so downstream delta
//! processing can still read them during the current tick.

use rustc_hash::{FxHashMap, FxHashSet};
use tickflow_common::{EngineTime, MIN_TIME, ScalarValue};

#[derive(Debug, Default)]
pub struct SetDelta {
    pub added_indices: Vec<usize>,
    pub removed_indices: Vec<usize>,
    pub removed_values: Vec<ScalarValue>,
    added_lookup: FxHashSet<ScalarValue>,
    removed_lookup: FxHashSet<ScalarValue>,
}

impl SetDelta {
    pub fn clear(&mut self) {
        self.added_indices.clear();
        self.removed_indices.clear();
        self.removed_values.clear();
        self.added_lookup.clear();
        self.removed_lookup.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added_indices.is_empty() && self.removed_indices.is_empty()
    }

    #[inline]
    pub fn was_added(&self, value: &ScalarValue) -> bool {
        self.added_lookup.contains(value)
    }

    #[inline]
    pub fn was_removed(&self, value: &ScalarValue) -> bool {
        self.removed_lookup.contains(value)
    }
}

#[derive(Debug, Default)]
pub struct SetStorage {
    slots: Vec<Option<ScalarValue>>,
    index_of: FxHashMap<ScalarValue, usize>,
    free: Vec<usize>,
    len: usize,
    pub delta: SetDelta,
}

/// Outcome of a set mutation, reported back so the arena can decide whether
/// the overlay needs marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMutation {
    /// The store changed.
    Changed,
    /// The store already satisfied the request.
    NoOp,
}

impl SetStorage {
    pub fn new() -> Self {
        Self::default()
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
    pub fn contains(&self, value: &ScalarValue) -> bool {
        self.index_of.contains_key(value)
    }

    pub fn values(&self) -> impl Iterator<Item = &ScalarValue> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn snapshot(&self) -> Vec<ScalarValue> {
        self.values().cloned().collect()
    }

    pub fn value_at(&self, index: usize) -> Option<&ScalarValue> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Drop delta state when a new tick starts writing.
    pub fn maybe_reset_delta(&mut self, last_modified: EngineTime, time: EngineTime) {
        if time != last_modified && last_modified != MIN_TIME {
            self.delta.clear();
        }
    }

    /// Insert `value` at `time`. An element removed earlier in the same tick
    /// and re-added cancels the removal instead of recording an add.
    pub fn insert(
        &mut self,
        value: ScalarValue,
        last_modified: EngineTime,
        time: EngineTime,
    ) -> SetMutation {
        if self.contains(&value) {
            return SetMutation::NoOp;
        }
        self.maybe_reset_delta(last_modified, time);

        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(value.clone());
        self.index_of.insert(value.clone(), index);
        self.len += 1;

        if time == last_modified && self.delta.removed_lookup.remove(&value) {
            // Same-tick remove-then-add: retract the removal record.
            if let Some(pos) = self
                .delta
                .removed_values
                .iter()
                .position(|v| *v == value)
            {
                self.delta.removed_values.remove(pos);
                self.delta.removed_indices.remove(pos);
            }
        } else {
            self.delta.added_indices.push(index);
            self.delta.added_lookup.insert(value);
        }
        SetMutation::Changed
    }

    /// Remove `value` at `time`. An element added earlier in the same tick
    /// and removed again retracts the add and leaves no delta.
    pub fn remove(
        &mut self,
        value: &ScalarValue,
        last_modified: EngineTime,
        time: EngineTime,
    ) -> SetMutation {
        let Some(index) = self.index_of.remove(value) else {
            return SetMutation::NoOp;
        };
        self.maybe_reset_delta(last_modified, time);

        let stored = self.slots[index].take().unwrap_or_else(|| value.clone());
        self.free.push(index);
        self.len -= 1;

        if time == last_modified && self.delta.added_lookup.remove(value) {
            // Same-tick add-then-remove: retract the add record.
            if let Some(pos) = self.delta.added_indices.iter().position(|&i| i == index) {
                self.delta.added_indices.remove(pos);
            }
        } else {
            self.delta.removed_indices.push(index);
            self.delta.removed_values.push(stored);
            self.delta.removed_lookup.insert(value.clone());
        }
        SetMutation::Changed
    }

    /// Remove every element, recording each removal.
    pub fn clear(&mut self, last_modified: EngineTime, time: EngineTime) {
        let all: Vec<ScalarValue> = self.snapshot();
        // After the first removal the overlay time is `time`; keep the delta
        // reset from re-triggering and dropping earlier removals.
        let mut effective = last_modified;
        for value in all {
            self.remove(&value, effective, time);
            effective = time;
        }
    }

    /// Values added this tick (delta indices resolved to values).
    pub fn added_values(&self) -> Vec<ScalarValue> {
        self.delta
            .added_indices
            .iter()
            .filter_map(|&i| self.value_at(i).cloned())
            .collect()
    }
}
