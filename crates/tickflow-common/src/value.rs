use chrono::{Duration as ChronoDur, NaiveDate, NaiveDateTime};
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// An opaque host-owned object stored behind a shared handle.
///
/// This is the single point where host semantics enter the engine: equality,
/// hashing, and rendering are delegated to the host object itself. Everything
/// else in the engine treats the handle as an ordinary hashable scalar.
pub trait HostObject: Send + Sync + std::fmt::Debug {
    fn host_eq(&self, other: &dyn HostObject) -> bool;
    fn host_hash(&self) -> u64;
    fn render(&self) -> String;

    /// Downcast support for hosts that need their object back.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The set of leaf types a time-series scalar may carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    Date,
    DateTime,
    Duration,
    Str,
    Object,
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Duration => "duration",
            Self::Str => "str",
            Self::Object => "object",
        })
    }
}

/// A scalar payload. The engine's typed storage dispatches on [`ScalarType`]
/// at the schema level; values themselves are this closed enum.
#[derive(Debug, Clone)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Duration(ChronoDur),
    Str(Arc<str>),
    Object(Arc<dyn HostObject>),
}

impl ScalarValue {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[inline]
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int(_) => ScalarType::Int,
            Self::Float(_) => ScalarType::Float,
            Self::Date(_) => ScalarType::Date,
            Self::DateTime(_) => ScalarType::DateTime,
            Self::Duration(_) => ScalarType::Duration,
            Self::Str(_) => ScalarType::Str,
            Self::Object(_) => ScalarType::Object,
        }
    }

    #[inline]
    pub fn matches_type(&self, ty: ScalarType) -> bool {
        self.scalar_type() == ty
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn HostObject>> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            // NaN-safe: values are equal iff their bit patterns are.
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.host_eq(other_obj(b)),
            _ => false,
        }
    }
}

fn other_obj(arc: &Arc<dyn HostObject>) -> &dyn HostObject {
    &**arc
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(x) => x.to_bits().hash(state),
            Self::Date(d) => d.hash(state),
            Self::DateTime(dt) => dt.hash(state),
            Self::Duration(d) => d.hash(state),
            Self::Str(s) => s.hash(state),
            Self::Object(o) => o.host_hash().hash(state),
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::Duration(d) => write!(f, "{d}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Object(o) => write!(f, "{}", o.render()),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for ScalarValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for ScalarValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for ScalarValue {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &ScalarValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn float_equality_is_bitwise() {
        assert_eq!(ScalarValue::Float(f64::NAN), ScalarValue::Float(f64::NAN));
        assert_ne!(ScalarValue::Float(0.0), ScalarValue::Float(-0.0));
        assert_eq!(
            hash_of(&ScalarValue::Float(1.5)),
            hash_of(&ScalarValue::Float(1.5))
        );
    }

    #[test]
    fn cross_type_never_equal() {
        assert_ne!(ScalarValue::Int(1), ScalarValue::Bool(true));
        assert_ne!(ScalarValue::Int(1), ScalarValue::Float(1.0));
    }

    #[test]
    fn type_tags() {
        assert_eq!(ScalarValue::from("x").scalar_type(), ScalarType::Str);
        assert!(ScalarValue::Int(3).matches_type(ScalarType::Int));
        assert!(!ScalarValue::Int(3).matches_type(ScalarType::Float));
    }

    #[derive(Debug)]
    struct Token(u32);

    impl HostObject for Token {
        fn host_eq(&self, other: &dyn HostObject) -> bool {
            other
                .as_any()
                .downcast_ref::<Token>()
                .is_some_and(|t| t.0 == self.0)
        }
        fn host_hash(&self) -> u64 {
            self.0 as u64
        }
        fn render(&self) -> String {
            format!("Token({})", self.0)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn host_objects_delegate_semantics() {
        let a = ScalarValue::Object(Arc::new(Token(7)));
        let b = ScalarValue::Object(Arc::new(Token(7)));
        let c = ScalarValue::Object(Arc::new(Token(9)));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.to_string(), "Token(7)");
    }
}
