//! Elementwise delta recomputation.
//!
//! When a deref-bound container input retargets (its Ref output starts
//! pointing at a different set or map), the downstream delta for that tick
//! is the elementwise difference between the old and new targets, not the
//! targets' own delta buffers.

use super::plain::PlainValue;
use rustc_hash::FxHashMap;
use tickflow_common::ScalarValue;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetDeltaResult {
    pub added: Vec<ScalarValue>,
    pub removed: Vec<ScalarValue>,
}

impl SetDeltaResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `old ⊖ new`: additions are elements in `new` but not `old`, removals the
/// reverse.
pub fn compute_set_delta(old: &[ScalarValue], new: &[ScalarValue]) -> SetDeltaResult {
    let old_lookup: FxHashMap<&ScalarValue, ()> = old.iter().map(|v| (v, ())).collect();
    let new_lookup: FxHashMap<&ScalarValue, ()> = new.iter().map(|v| (v, ())).collect();
    SetDeltaResult {
        added: new
            .iter()
            .filter(|v| !old_lookup.contains_key(*v))
            .cloned()
            .collect(),
        removed: old
            .iter()
            .filter(|v| !new_lookup.contains_key(*v))
            .cloned()
            .collect(),
    }
}

/// Set delta when one side is invalid: the absent side is treated as empty.
pub fn compute_full_set_delta(new: &[ScalarValue]) -> SetDeltaResult {
    SetDeltaResult {
        added: new.to_vec(),
        removed: Vec::new(),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapDeltaResult {
    pub added: Vec<(ScalarValue, PlainValue)>,
    pub removed: Vec<ScalarValue>,
    pub modified: Vec<(ScalarValue, PlainValue)>,
}

impl MapDeltaResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Keyed `old ⊖ new`: entries only in `new` are additions, keys only in
/// `old` are removals, keys in both whose values differ are modifications.
pub fn compute_map_delta(
    old: &[(ScalarValue, PlainValue)],
    new: &[(ScalarValue, PlainValue)],
) -> MapDeltaResult {
    let old_lookup: FxHashMap<&ScalarValue, &PlainValue> =
        old.iter().map(|(k, v)| (k, v)).collect();
    let new_keys: FxHashMap<&ScalarValue, ()> = new.iter().map(|(k, _)| (k, ())).collect();

    let mut result = MapDeltaResult::default();
    for (key, value) in new {
        match old_lookup.get(key) {
            None => result.added.push((key.clone(), value.clone())),
            Some(old_value) if *old_value != value => {
                result.modified.push((key.clone(), value.clone()));
            }
            Some(_) => {}
        }
    }
    for (key, _) in old {
        if !new_keys.contains_key(key) {
            result.removed.push(key.clone());
        }
    }
    result
}

/// Map delta when one side is invalid: the absent side is treated as empty.
pub fn compute_full_map_delta(new: &[(ScalarValue, PlainValue)]) -> MapDeltaResult {
    MapDeltaResult {
        added: new.to_vec(),
        removed: Vec::new(),
        modified: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<ScalarValue> {
        values.iter().map(|&v| ScalarValue::Int(v)).collect()
    }

    #[test]
    fn set_delta_is_symmetric_difference_split() {
        let delta = compute_set_delta(&ints(&[1, 2, 3]), &ints(&[2, 3, 4]));
        assert_eq!(delta.added, ints(&[4]));
        assert_eq!(delta.removed, ints(&[1]));

        assert!(compute_set_delta(&ints(&[1]), &ints(&[1])).is_empty());
    }

    #[test]
    fn full_set_delta_treats_old_as_empty() {
        let delta = compute_full_set_delta(&ints(&[7, 8]));
        assert_eq!(delta.added, ints(&[7, 8]));
        assert!(delta.removed.is_empty());
    }

    #[test]
    fn map_delta_splits_three_ways() {
        let old = vec![
            (ScalarValue::from("a"), PlainValue::scalar(1i64)),
            (ScalarValue::from("b"), PlainValue::scalar(2i64)),
        ];
        let new = vec![
            (ScalarValue::from("b"), PlainValue::scalar(20i64)),
            (ScalarValue::from("c"), PlainValue::scalar(3i64)),
        ];
        let delta = compute_map_delta(&old, &new);
        assert_eq!(delta.added, vec![(ScalarValue::from("c"), PlainValue::scalar(3i64))]);
        assert_eq!(delta.removed, vec![ScalarValue::from("a")]);
        assert_eq!(
            delta.modified,
            vec![(ScalarValue::from("b"), PlainValue::scalar(20i64))]
        );
    }
}
