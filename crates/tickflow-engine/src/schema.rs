//! Time-series schemas.
//!
//! A schema is a tree of [`TsKind`] nodes describing the shape of a
//! time-series value. Schemas are interned: constructing the same tree twice
//! yields the same `Arc`, so identity checks throughout the engine are
//! pointer comparisons ([`TsSchema::same`]).

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fmt::{self, Display};
use std::sync::Arc;
use tickflow_common::{EngineDelta, ScalarType};

pub type Schema = Arc<TsSchema>;

/// Bound for a rolling window: either a fixed element count (cyclic buffer)
/// or a time span (queue with eviction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowSpec {
    Count(usize),
    Period(EngineDelta),
}

/// The closed set of time-series shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TsKind {
    /// Leaf of a primitive type.
    Scalar(ScalarType),
    /// Fixed-key record; field order is part of identity.
    Bundle(Vec<(Arc<str>, Schema)>),
    /// Fixed-size list, `len > 0`.
    List { elem: Schema, len: usize },
    /// Variable-length list.
    DynList { elem: Schema },
    /// Unordered set of hashable scalars.
    Set { elem: ScalarType },
    /// Scalar keys to time-series values.
    Map { key: ScalarType, value: Schema },
    /// Rolling history of scalar samples.
    Window { elem: ScalarType, spec: WindowSpec },
    /// Indirection: the value names another time-series.
    Ref { inner: Schema },
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TsSchema {
    kind: TsKind,
}

static INTERNER: Lazy<Mutex<FxHashSet<Schema>>> = Lazy::new(|| Mutex::new(FxHashSet::default()));

fn intern(kind: TsKind) -> Schema {
    let candidate = TsSchema { kind };
    let mut interner = INTERNER.lock();
    if let Some(existing) = interner.get(&candidate) {
        return Arc::clone(existing);
    }
    let schema = Arc::new(candidate);
    interner.insert(Arc::clone(&schema));
    schema
}

impl TsSchema {
    pub fn scalar(ty: ScalarType) -> Schema {
        intern(TsKind::Scalar(ty))
    }

    pub fn bundle<N>(fields: impl IntoIterator<Item = (N, Schema)>) -> Schema
    where
        N: Into<Arc<str>>,
    {
        let fields: Vec<(Arc<str>, Schema)> =
            fields.into_iter().map(|(n, s)| (n.into(), s)).collect();
        intern(TsKind::Bundle(fields))
    }

    pub fn list(elem: Schema, len: usize) -> Schema {
        assert!(len > 0, "fixed list schema requires len > 0");
        intern(TsKind::List { elem, len })
    }

    pub fn dyn_list(elem: Schema) -> Schema {
        intern(TsKind::DynList { elem })
    }

    pub fn set(elem: ScalarType) -> Schema {
        intern(TsKind::Set { elem })
    }

    pub fn map(key: ScalarType, value: Schema) -> Schema {
        intern(TsKind::Map { key, value })
    }

    pub fn window(elem: ScalarType, spec: WindowSpec) -> Schema {
        intern(TsKind::Window { elem, spec })
    }

    pub fn reference(inner: Schema) -> Schema {
        intern(TsKind::Ref { inner })
    }

    #[inline]
    pub fn kind(&self) -> &TsKind {
        &self.kind
    }

    /// Identity after interning is pointer identity.
    #[inline]
    pub fn same(a: &Schema, b: &Schema) -> bool {
        Arc::ptr_eq(a, b)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, TsKind::Scalar(_))
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.kind, TsKind::Ref { .. })
    }

    pub fn as_scalar(&self) -> Option<ScalarType> {
        match &self.kind {
            TsKind::Scalar(ty) => Some(*ty),
            _ => None,
        }
    }

    /// The inner schema of a `Ref`, if this is one.
    pub fn deref_inner(&self) -> Option<&Schema> {
        match &self.kind {
            TsKind::Ref { inner } => Some(inner),
            _ => None,
        }
    }

    /// Number of statically addressable children (bundle fields / list slots).
    pub fn child_count(&self) -> usize {
        match &self.kind {
            TsKind::Bundle(fields) => fields.len(),
            TsKind::List { len, .. } => *len,
            _ => 0,
        }
    }

    /// Schema of the statically addressable child at `index`.
    pub fn child(&self, index: usize) -> Option<&Schema> {
        match &self.kind {
            TsKind::Bundle(fields) => fields.get(index).map(|(_, s)| s),
            TsKind::List { elem, len } => (index < *len).then_some(elem),
            _ => None,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        match &self.kind {
            TsKind::Bundle(fields) => fields.iter().position(|(n, _)| &**n == name),
            _ => None,
        }
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        match &self.kind {
            TsKind::Bundle(fields) => fields.get(index).map(|(n, _)| &**n),
            _ => None,
        }
    }

    /// True if any leaf of the subtree is a `Ref`.
    pub fn contains_ref(&self) -> bool {
        match &self.kind {
            TsKind::Ref { .. } => true,
            TsKind::Scalar(_) | TsKind::Set { .. } | TsKind::Window { .. } => false,
            TsKind::Bundle(fields) => fields.iter().any(|(_, s)| s.contains_ref()),
            TsKind::List { elem, .. } | TsKind::DynList { elem } => elem.contains_ref(),
            TsKind::Map { value, .. } => value.contains_ref(),
        }
    }
}

impl Display for TsSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TsKind::Scalar(ty) => write!(f, "TS[{ty}]"),
            TsKind::Bundle(fields) => {
                f.write_str("TSB{")?;
                for (i, (name, schema)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {schema}")?;
                }
                f.write_str("}")
            }
            TsKind::List { elem, len } => write!(f, "TSL[{elem}; {len}]"),
            TsKind::DynList { elem } => write!(f, "TSL[{elem}]"),
            TsKind::Set { elem } => write!(f, "TSS[{elem}]"),
            TsKind::Map { key, value } => write!(f, "TSD[{key}, {value}]"),
            TsKind::Window { elem, spec } => match spec {
                WindowSpec::Count(n) => write!(f, "TSW[{elem}; {n}]"),
                WindowSpec::Period(d) => write!(f, "TSW[{elem}; {d}]"),
            },
            TsKind::Ref { inner } => write!(f, "REF[{inner}]"),
        }
    }
}

/// Result of matching an input schema against an output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMatch {
    /// Identical after interning; the input shares the output's storage.
    Peer,
    /// The output is a `Ref` whose inner type the input accepts.
    Deref,
    /// Same shape with at least one deref somewhere below.
    Composite,
    Mismatch,
}

/// Classify how an input of schema `input` may bind to an output of schema
/// `output`.
///
/// Set, map, and window containers whose element type involves a `Ref`
/// classify as `Composite`, but the edge itself is whole-container: the
/// binding layer treats them atomically and recomputes deltas on retarget.
pub fn match_schemas(input: &Schema, output: &Schema) -> SchemaMatch {
    if TsSchema::same(input, output) {
        return SchemaMatch::Peer;
    }
    if let Some(inner) = output.deref_inner() {
        if match_schemas(input, inner) != SchemaMatch::Mismatch {
            return SchemaMatch::Deref;
        }
    }
    match (input.kind(), output.kind()) {
        (TsKind::Bundle(a), TsKind::Bundle(b)) => {
            if a.len() != b.len() || a.iter().zip(b).any(|((n1, _), (n2, _))| n1 != n2) {
                return SchemaMatch::Mismatch;
            }
            combine_children(
                a.iter()
                    .zip(b)
                    .map(|((_, s1), (_, s2))| match_schemas(s1, s2)),
            )
        }
        (
            TsKind::List { elem: a, len: la },
            TsKind::List { elem: b, len: lb },
        ) if la == lb => combine_children(std::iter::once(match_schemas(a, b))),
        (TsKind::DynList { elem: a }, TsKind::DynList { elem: b }) => {
            combine_children(std::iter::once(match_schemas(a, b)))
        }
        (
            TsKind::Map { key: k1, value: v1 },
            TsKind::Map { key: k2, value: v2 },
        ) if k1 == k2 => combine_children(std::iter::once(match_schemas(v1, v2))),
        _ => SchemaMatch::Mismatch,
    }
}

fn combine_children(children: impl Iterator<Item = SchemaMatch>) -> SchemaMatch {
    let mut any_indirect = false;
    for m in children {
        match m {
            SchemaMatch::Mismatch => return SchemaMatch::Mismatch,
            SchemaMatch::Deref | SchemaMatch::Composite => any_indirect = true,
            SchemaMatch::Peer => {}
        }
    }
    if any_indirect {
        SchemaMatch::Composite
    } else {
        // Identical structure with all-peer children would have interned to
        // the same pointer and matched Peer above.
        SchemaMatch::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_yields_pointer_identity() {
        let a = TsSchema::bundle([("x", TsSchema::scalar(ScalarType::Int))]);
        let b = TsSchema::bundle([("x", TsSchema::scalar(ScalarType::Int))]);
        assert!(TsSchema::same(&a, &b));

        let c = TsSchema::bundle([("y", TsSchema::scalar(ScalarType::Int))]);
        assert!(!TsSchema::same(&a, &c));
    }

    #[test]
    fn field_order_is_identity() {
        let int = TsSchema::scalar(ScalarType::Int);
        let ab = TsSchema::bundle([("a", int.clone()), ("b", int.clone())]);
        let ba = TsSchema::bundle([("b", int.clone()), ("a", int)]);
        assert!(!TsSchema::same(&ab, &ba));
    }

    #[test]
    fn peer_match_is_pointer_equality() {
        let s = TsSchema::set(ScalarType::Str);
        assert_eq!(match_schemas(&s, &TsSchema::set(ScalarType::Str)), SchemaMatch::Peer);
        assert_eq!(
            match_schemas(&s, &TsSchema::set(ScalarType::Int)),
            SchemaMatch::Mismatch
        );
    }

    #[test]
    fn deref_match() {
        let int = TsSchema::scalar(ScalarType::Int);
        let ref_int = TsSchema::reference(int.clone());
        assert_eq!(match_schemas(&int, &ref_int), SchemaMatch::Deref);
        // Nested: REF[REF[int]] derefs to REF[int].
        let ref_ref = TsSchema::reference(ref_int.clone());
        assert_eq!(match_schemas(&ref_int, &ref_ref), SchemaMatch::Deref);
        // And all the way down to the scalar.
        assert_eq!(match_schemas(&int, &ref_ref), SchemaMatch::Deref);
    }

    #[test]
    fn composite_bundle_match() {
        let int = TsSchema::scalar(ScalarType::Int);
        let ref_int = TsSchema::reference(int.clone());
        let input = TsSchema::bundle([("a", int.clone()), ("b", int.clone())]);
        let output = TsSchema::bundle([("a", int.clone()), ("b", ref_int)]);
        assert_eq!(match_schemas(&input, &output), SchemaMatch::Composite);

        let wrong_name = TsSchema::bundle([("a", int.clone()), ("c", int)]);
        assert_eq!(match_schemas(&wrong_name, &output), SchemaMatch::Mismatch);
    }

    #[test]
    fn map_with_ref_values_is_composite() {
        let int = TsSchema::scalar(ScalarType::Int);
        let input = TsSchema::map(ScalarType::Str, int.clone());
        let output = TsSchema::map(ScalarType::Str, TsSchema::reference(int));
        assert_eq!(match_schemas(&input, &output), SchemaMatch::Composite);
    }

    #[test]
    fn contains_ref_walks_the_tree() {
        let int = TsSchema::scalar(ScalarType::Int);
        assert!(!int.contains_ref());
        let nested = TsSchema::bundle([(
            "m",
            TsSchema::map(ScalarType::Str, TsSchema::reference(int.clone())),
        )]);
        assert!(nested.contains_ref());
        assert!(!TsSchema::list(int, 3).contains_ref());
    }

    #[test]
    fn rendering() {
        let s = TsSchema::bundle([
            ("px", TsSchema::scalar(ScalarType::Float)),
            ("qty", TsSchema::scalar(ScalarType::Int)),
        ]);
        assert_eq!(s.to_string(), "TSB{px: TS[float], qty: TS[int]}");
        assert_eq!(
            TsSchema::window(ScalarType::Float, WindowSpec::Count(10)).to_string(),
            "TSW[float; 10]"
        );
    }
}
