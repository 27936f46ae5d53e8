//! Detached plain renderings of time-series values.
//!
//! [`PlainValue`] is the currency of the host boundary: snapshots handed to
//! user callbacks, input renderings in captured errors, and the recordable
//! state wire format all go through it. Schema checks happen here and only
//! here; internal write paths assume well-typed data.

use super::arena::{Effects, TsArena, TsId};
use super::data::{RefValue, TsData};
use crate::schema::TsKind;
use serde_json::{Value as Json, json};
use tickflow_common::{EngineError, EngineTime, ScalarValue};

/// Rendering of a reference value with the target reduced to an opaque
/// handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlainRef {
    Empty,
    Bound(u32),
    Unbound(Vec<PlainRef>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlainValue {
    /// Invalid / unset; writing `Empty` leaves the position untouched.
    Empty,
    Scalar(ScalarValue),
    Bundle(Vec<PlainValue>),
    List(Vec<PlainValue>),
    Set(Vec<ScalarValue>),
    Map(Vec<(ScalarValue, PlainValue)>),
    Window(Vec<(EngineTime, ScalarValue)>),
    Ref(PlainRef),
}

impl PlainValue {
    pub fn scalar(v: impl Into<ScalarValue>) -> Self {
        Self::Scalar(v.into())
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            Self::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Empty => "<empty>".to_string(),
            Self::Scalar(v) => v.to_string(),
            Self::Bundle(children) | Self::List(children) => {
                let parts: Vec<String> = children.iter().map(|c| c.render()).collect();
                format!("[{}]", parts.join(", "))
            }
            Self::Set(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Self::Map(entries) => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.render()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Self::Window(samples) => format!("<window of {}>", samples.len()),
            Self::Ref(PlainRef::Empty) => "REF<empty>".to_string(),
            Self::Ref(PlainRef::Bound(raw)) => format!("REF<#{raw}>"),
            Self::Ref(PlainRef::Unbound(items)) => format!("REF<{} items>", items.len()),
        }
    }
}

fn plain_ref(value: &RefValue) -> PlainRef {
    match value {
        RefValue::Empty => PlainRef::Empty,
        RefValue::Bound(id) => PlainRef::Bound(id.raw()),
        RefValue::Unbound(items) => PlainRef::Unbound(items.iter().map(plain_ref).collect()),
    }
}

impl TsArena {
    /// Detach the value at `id` into an owned rendering.
    pub fn to_plain(&self, id: TsId) -> PlainValue {
        match &self.slot(id).data {
            TsData::Scalar(None) => PlainValue::Empty,
            TsData::Scalar(Some(v)) => PlainValue::Scalar(v.clone()),
            TsData::Bundle(children) => {
                PlainValue::Bundle(children.iter().map(|&c| self.to_plain(c)).collect())
            }
            TsData::List(children) => {
                PlainValue::List(children.iter().map(|&c| self.to_plain(c)).collect())
            }
            TsData::Set(set) => PlainValue::Set(set.snapshot()),
            TsData::Map(map) => PlainValue::Map(
                map.entries()
                    .map(|(k, child)| (k.clone(), self.to_plain(child)))
                    .collect(),
            ),
            TsData::Window(w) => PlainValue::Window(w.snapshot()),
            TsData::Ref(r) => PlainValue::Ref(plain_ref(r)),
        }
    }

    /// Apply a plain value at `time`. Containers are diff-applied so the
    /// delta machinery observes the minimal structural change; `Empty`
    /// leaves a position untouched.
    pub fn set_from_plain(
        &mut self,
        id: TsId,
        value: &PlainValue,
        time: EngineTime,
        fx: &mut Effects,
    ) -> Result<(), EngineError> {
        let schema = self.slot(id).schema.clone();
        match (schema.kind(), value) {
            (_, PlainValue::Empty) => Ok(()),
            (TsKind::Scalar(_), PlainValue::Scalar(v)) => self.set_scalar(id, v.clone(), time, fx),
            (TsKind::Bundle(fields), PlainValue::Bundle(values)) => {
                if fields.len() != values.len() {
                    return Err(EngineError::binding(format!(
                        "bundle of {} values written to {schema}",
                        values.len()
                    )));
                }
                for (i, v) in values.iter().enumerate() {
                    let child = self
                        .child_at(id, i)
                        .ok_or_else(|| EngineError::internal("bundle child missing"))?;
                    self.set_from_plain(child, v, time, fx)?;
                }
                Ok(())
            }
            (TsKind::List { len, .. }, PlainValue::List(values)) => {
                if *len != values.len() {
                    return Err(EngineError::binding(format!(
                        "list of {} values written to {schema}",
                        values.len()
                    )));
                }
                for (i, v) in values.iter().enumerate() {
                    let child = self
                        .child_at(id, i)
                        .ok_or_else(|| EngineError::internal("list child missing"))?;
                    self.set_from_plain(child, v, time, fx)?;
                }
                Ok(())
            }
            (TsKind::DynList { .. }, PlainValue::List(values)) => {
                while self.child_count(id) > values.len() {
                    self.dyn_list_pop(id, time, fx);
                }
                while self.child_count(id) < values.len() {
                    self.dyn_list_push(id, time, fx);
                }
                for (i, v) in values.iter().enumerate() {
                    let child = self
                        .child_at(id, i)
                        .ok_or_else(|| EngineError::internal("dynamic list child missing"))?;
                    self.set_from_plain(child, v, time, fx)?;
                }
                Ok(())
            }
            (TsKind::Set { elem }, PlainValue::Set(values)) => {
                for v in values {
                    if !v.matches_type(*elem) {
                        return Err(EngineError::binding(format!(
                            "set element of type {} written to {schema}",
                            v.scalar_type()
                        )));
                    }
                }
                let current = self.set_snapshot(id);
                for old in &current {
                    if !values.contains(old) {
                        self.set_remove(id, old, time, fx);
                    }
                }
                for new in values {
                    self.set_add(id, new.clone(), time, fx);
                }
                Ok(())
            }
            (TsKind::Map { .. }, PlainValue::Map(entries)) => {
                let current = self.map_keys(id);
                for old in &current {
                    if !entries.iter().any(|(k, _)| k == old) {
                        self.map_remove(id, old, time, fx)?;
                    }
                }
                for (key, v) in entries {
                    let child = self.map_get_or_create(id, key, time, fx)?;
                    self.set_from_plain(child, v, time, fx)?;
                }
                Ok(())
            }
            (TsKind::Window { .. }, PlainValue::Scalar(v)) => {
                self.window_push(id, v.clone(), time, fx)
            }
            (TsKind::Window { .. }, PlainValue::Window(samples)) => {
                for (t, v) in samples {
                    self.window_push(id, v.clone(), *t, fx)?;
                }
                Ok(())
            }
            (TsKind::Ref { .. }, PlainValue::Ref(PlainRef::Empty)) => {
                self.set_ref(id, RefValue::Empty, time, fx);
                Ok(())
            }
            _ => Err(EngineError::binding(format!(
                "value shape does not match schema {schema}"
            ))),
        }
    }
}

/* ───────────────────── wire encoding ─────────────────────
Recordable state is persisted as JSON. Host objects render to a
string and do not round-trip; recordable state bundles are expected
to stay within the data scalars.
--------------------------------------------------------- */

fn scalar_to_json(v: &ScalarValue) -> Json {
    match v {
        ScalarValue::Bool(b) => json!({ "bool": b }),
        ScalarValue::Int(i) => json!({ "int": i }),
        ScalarValue::Float(x) => json!({ "float": x }),
        ScalarValue::Date(d) => json!({ "date": d.to_string() }),
        ScalarValue::DateTime(dt) => json!({ "datetime": dt.and_utc().timestamp_micros() }),
        ScalarValue::Duration(d) => json!({ "duration": d.num_microseconds() }),
        ScalarValue::Str(s) => json!({ "str": &**s }),
        ScalarValue::Object(o) => json!({ "object": o.render() }),
    }
}

fn scalar_from_json(v: &Json) -> Result<ScalarValue, EngineError> {
    let obj = v
        .as_object()
        .ok_or_else(|| EngineError::internal("malformed scalar record"))?;
    let (tag, payload) = obj
        .iter()
        .next()
        .ok_or_else(|| EngineError::internal("empty scalar record"))?;
    let err = || EngineError::internal(format!("malformed {tag} record"));
    match tag.as_str() {
        "bool" => payload.as_bool().map(ScalarValue::Bool).ok_or_else(err),
        "int" => payload.as_i64().map(ScalarValue::Int).ok_or_else(err),
        "float" => payload.as_f64().map(ScalarValue::Float).ok_or_else(err),
        "date" => payload
            .as_str()
            .and_then(|s| s.parse().ok())
            .map(ScalarValue::Date)
            .ok_or_else(err),
        "datetime" => payload
            .as_i64()
            .and_then(chrono::DateTime::from_timestamp_micros)
            .map(|dt| ScalarValue::DateTime(dt.naive_utc()))
            .ok_or_else(err),
        "duration" => payload
            .as_i64()
            .map(|us| ScalarValue::Duration(chrono::Duration::microseconds(us)))
            .ok_or_else(err),
        "str" => payload
            .as_str()
            .map(ScalarValue::from)
            .ok_or_else(err),
        "object" => Err(EngineError::internal(
            "host objects do not round-trip through recorded state",
        )),
        _ => Err(err()),
    }
}

pub fn plain_to_json(value: &PlainValue) -> Json {
    match value {
        PlainValue::Empty => Json::Null,
        PlainValue::Scalar(v) => scalar_to_json(v),
        PlainValue::Bundle(children) => {
            json!({ "bundle": children.iter().map(plain_to_json).collect::<Vec<_>>() })
        }
        PlainValue::List(children) => {
            json!({ "list": children.iter().map(plain_to_json).collect::<Vec<_>>() })
        }
        PlainValue::Set(values) => {
            json!({ "set": values.iter().map(scalar_to_json).collect::<Vec<_>>() })
        }
        PlainValue::Map(entries) => json!({
            "map": entries
                .iter()
                .map(|(k, v)| json!([scalar_to_json(k), plain_to_json(v)]))
                .collect::<Vec<_>>()
        }),
        PlainValue::Window(samples) => json!({
            "window": samples
                .iter()
                .map(|(t, v)| json!([t.micros(), scalar_to_json(v)]))
                .collect::<Vec<_>>()
        }),
        PlainValue::Ref(_) => json!({ "ref": Json::Null }),
    }
}

pub fn plain_from_json(value: &Json) -> Result<PlainValue, EngineError> {
    if value.is_null() {
        return Ok(PlainValue::Empty);
    }
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::internal("malformed value record"))?;
    let (tag, payload) = obj
        .iter()
        .next()
        .ok_or_else(|| EngineError::internal("empty value record"))?;
    let arr = || {
        payload
            .as_array()
            .ok_or_else(|| EngineError::internal(format!("malformed {tag} record")))
    };
    match tag.as_str() {
        "bundle" => Ok(PlainValue::Bundle(
            arr()?.iter().map(plain_from_json).collect::<Result<_, _>>()?,
        )),
        "list" => Ok(PlainValue::List(
            arr()?.iter().map(plain_from_json).collect::<Result<_, _>>()?,
        )),
        "set" => Ok(PlainValue::Set(
            arr()?.iter().map(scalar_from_json).collect::<Result<_, _>>()?,
        )),
        "map" => {
            let mut entries = Vec::new();
            for pair in arr()? {
                let pair = pair
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| EngineError::internal("malformed map record"))?;
                entries.push((scalar_from_json(&pair[0])?, plain_from_json(&pair[1])?));
            }
            Ok(PlainValue::Map(entries))
        }
        "window" => {
            let mut samples = Vec::new();
            for pair in arr()? {
                let pair = pair
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| EngineError::internal("malformed window record"))?;
                let t = pair[0]
                    .as_i64()
                    .ok_or_else(|| EngineError::internal("malformed window time"))?;
                samples.push((EngineTime::from_micros(t), scalar_from_json(&pair[1])?));
            }
            Ok(PlainValue::Window(samples))
        }
        "ref" => Ok(PlainValue::Ref(PlainRef::Empty)),
        _ => Ok(PlainValue::Scalar(scalar_from_json(value)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TsSchema;
    use crate::ts::data::OutputId;
    use tickflow_common::ScalarType;

    fn t(us: i64) -> EngineTime {
        EngineTime::from_micros(us)
    }

    #[test]
    fn bundle_round_trip() {
        let mut arena = TsArena::new();
        let schema = TsSchema::bundle([
            ("a", TsSchema::scalar(ScalarType::Int)),
            ("b", TsSchema::scalar(ScalarType::Str)),
        ]);
        let id = arena.alloc_value(&schema, None, OutputId::Main, None);
        let mut fx = Effects::default();
        let value = PlainValue::Bundle(vec![
            PlainValue::scalar(1i64),
            PlainValue::scalar("hi"),
        ]);
        arena.set_from_plain(id, &value, t(1), &mut fx).unwrap();
        assert_eq!(arena.to_plain(id), value);
    }

    #[test]
    fn partial_bundle_write_skips_empty() {
        let mut arena = TsArena::new();
        let schema = TsSchema::bundle([
            ("a", TsSchema::scalar(ScalarType::Int)),
            ("b", TsSchema::scalar(ScalarType::Int)),
        ]);
        let id = arena.alloc_value(&schema, None, OutputId::Main, None);
        let mut fx = Effects::default();
        arena
            .set_from_plain(
                id,
                &PlainValue::Bundle(vec![PlainValue::scalar(1i64), PlainValue::Empty]),
                t(1),
                &mut fx,
            )
            .unwrap();
        assert!(arena.modified_at(arena.child_at(id, 0).unwrap(), t(1)));
        assert!(!arena.valid(arena.child_at(id, 1).unwrap()));
    }

    #[test]
    fn map_write_is_diff_applied() {
        let mut arena = TsArena::new();
        let schema = TsSchema::map(ScalarType::Str, TsSchema::scalar(ScalarType::Int));
        let id = arena.alloc_value(&schema, None, OutputId::Main, None);
        let mut fx = Effects::default();
        arena
            .set_from_plain(
                id,
                &PlainValue::Map(vec![
                    ("a".into(), PlainValue::scalar(1i64)),
                    ("b".into(), PlainValue::scalar(2i64)),
                ]),
                t(1),
                &mut fx,
            )
            .unwrap();
        arena
            .set_from_plain(
                id,
                &PlainValue::Map(vec![("b".into(), PlainValue::scalar(2i64))]),
                t(2),
                &mut fx,
            )
            .unwrap();
        assert!(arena.map_has_delta_at(id, t(2)));
        assert_eq!(arena.map_removed(id).len(), 1);
        assert_eq!(arena.map_removed(id)[0].0, ScalarValue::from("a"));
    }

    #[test]
    fn json_round_trip() {
        let value = PlainValue::Bundle(vec![
            PlainValue::scalar(5i64),
            PlainValue::Set(vec![1i64.into(), 2i64.into()]),
            PlainValue::Map(vec![("k".into(), PlainValue::scalar(1.5f64))]),
            PlainValue::Window(vec![(t(3), 9i64.into())]),
            PlainValue::Empty,
        ]);
        let encoded = plain_to_json(&value);
        assert_eq!(plain_from_json(&encoded).unwrap(), value);
    }

    #[test]
    fn type_mismatch_rejected_at_the_boundary() {
        let mut arena = TsArena::new();
        let id = arena.alloc_value(&TsSchema::scalar(ScalarType::Int), None, OutputId::Main, None);
        let mut fx = Effects::default();
        assert!(
            arena
                .set_from_plain(id, &PlainValue::scalar("nope"), t(1), &mut fx)
                .is_err()
        );
    }
}
