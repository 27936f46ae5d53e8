//! Engine error taxonomy.
//!
//! Only [`NodeError`] ever travels on a data path (routed to a node's error
//! output when exception capture is enabled); every other variant unwinds the
//! engine. See the propagation policy on [`EngineError`].

use std::fmt::{self, Display};
use thiserror::Error;

/// The single error type the engine's fallible operations return.
///
/// Propagation policy:
/// - `Wiring` is produced at graph construction and surfaces to the host
///   before the engine runs.
/// - `Binding` is the runtime form of a schema mismatch (rare; wiring checks
///   catch almost all of these earlier).
/// - `Node` is a user-code failure during eval. With exception capture it is
///   converted to a value and written to the error output; otherwise it is
///   re-raised enriched with the node path.
/// - `Scheduling`, `Concurrency`, and `Internal` are always fatal.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("wiring error: {0}")]
    Wiring(String),

    #[error("binding error: {0}")]
    Binding(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("concurrency error: {0}")]
    Concurrency(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Node(NodeError),
}

impl EngineError {
    pub fn wiring(msg: impl Into<String>) -> Self {
        Self::Wiring(msg.into())
    }

    pub fn binding(msg: impl Into<String>) -> Self {
        Self::Binding(msg.into())
    }

    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling(msg.into())
    }

    pub fn concurrency(msg: impl Into<String>) -> Self {
        Self::Concurrency(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// A failure raised by user code during eval. The node path and
    /// signature are filled in by the engine when the error is captured or
    /// re-raised.
    pub fn node_failure(msg: impl Into<String>) -> Self {
        Self::Node(NodeError::new(String::new(), msg, "NodeError"))
    }

    /// Short kind name, used when packaging a captured error into a value.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Wiring(_) => "WiringError",
            Self::Binding(_) => "BindingError",
            Self::Scheduling(_) => "SchedulingError",
            Self::Concurrency(_) => "ConcurrencyError",
            Self::Internal(_) => "InternalError",
            Self::Node(_) => "NodeError",
        }
    }

    /// True for the variants the engine never recovers from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Scheduling(_) | Self::Concurrency(_) | Self::Internal(_)
        )
    }
}

/// A captured evaluation failure, transparent to the data plane.
///
/// Carries enough to locate the failing node and its state at the time of
/// failure: the fully qualified node path, the message, the kind name of the
/// underlying error, the retained frames (bounded by the node's
/// `trace_back_depth`), the signature rendering, and a rendering of the input
/// values when capture was configured to take one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeError {
    pub node_path: String,
    pub message: String,
    pub error_kind: String,
    pub frames: Vec<String>,
    pub signature: String,
    pub input_snapshot: Option<String>,
}

impl NodeError {
    pub fn new(
        node_path: impl Into<String>,
        message: impl Into<String>,
        error_kind: impl Into<String>,
    ) -> Self {
        Self {
            node_path: node_path.into(),
            message: message.into(),
            error_kind: error_kind.into(),
            frames: Vec::new(),
            signature: String::new(),
            input_snapshot: None,
        }
    }

    pub fn with_frames(mut self, frames: Vec<String>, depth: usize) -> Self {
        self.frames = frames;
        if self.frames.len() > depth {
            self.frames.truncate(depth);
        }
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_input_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.input_snapshot = Some(snapshot.into());
        self
    }
}

impl Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node_path.is_empty() {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "{}: {}", self.node_path, self.message)?;
        }
        if !self.signature.is_empty() {
            write!(f, "\n  signature: {}", self.signature)?;
        }
        for frame in &self.frames {
            write!(f, "\n  at {frame}")?;
        }
        if let Some(snapshot) = &self.input_snapshot {
            write!(f, "\n  inputs: {snapshot}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NodeError {}

impl From<NodeError> for EngineError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

/// A captured error travels the data plane as an opaque host value, observed
/// by downstream nodes exactly like any other value.
impl crate::value::HostObject for NodeError {
    fn host_eq(&self, other: &dyn crate::value::HostObject) -> bool {
        other
            .as_any()
            .downcast_ref::<NodeError>()
            .is_some_and(|e| e == self)
    }

    fn host_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.node_path.hash(&mut hasher);
        self.message.hash(&mut hasher);
        hasher.finish()
    }

    fn render(&self) -> String {
        self.to_string()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
