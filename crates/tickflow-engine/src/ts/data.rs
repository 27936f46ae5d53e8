//! Typed storage payloads, one variant per schema kind.

use super::arena::TsId;
use super::map::MapStorage;
use super::set::SetStorage;
use super::window::WindowStorage;
use smallvec::SmallVec;
use tickflow_common::ScalarValue;

/// The value of a reference time-series: nothing, a bound target, or (for
/// composite references) a list of per-child references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Empty,
    Bound(TsId),
    Unbound(Vec<RefValue>),
}

impl RefValue {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Bound(_))
    }

    pub fn target(&self) -> Option<TsId> {
        match self {
            Self::Bound(id) => Some(*id),
            _ => None,
        }
    }

    pub fn item(&self, index: usize) -> Option<&RefValue> {
        match self {
            Self::Unbound(items) => items.get(index),
            _ => None,
        }
    }
}

/// Identity of an output within its owning node.
///
/// `Main`, `Error`, and `State` are the well-known outputs; `Feature` is a
/// synthesized derived output (keyed by an allocation ordinal); `Cast` is a
/// lazily materialized re-typed view of another output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputId {
    Main,
    Error,
    State,
    Feature(u32),
    Cast,
}

/// Storage payload of one arena slot. The variant always agrees with the
/// slot's schema kind.
#[derive(Debug)]
pub enum TsData {
    Scalar(Option<ScalarValue>),
    Bundle(SmallVec<[TsId; 4]>),
    /// Fixed and dynamic lists share a representation; the schema
    /// distinguishes them.
    List(Vec<TsId>),
    Set(SetStorage),
    Map(MapStorage),
    Window(WindowStorage),
    Ref(RefValue),
}

impl TsData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Bundle(_) => "bundle",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Window(_) => "window",
            Self::Ref(_) => "ref",
        }
    }
}
