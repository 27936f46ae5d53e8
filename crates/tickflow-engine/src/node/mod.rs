//! Node declarations and lifecycle.

pub mod error;

use crate::graph::NodeContext;
use crate::schema::Schema;
use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::{self, Display};
use std::sync::Arc;
use tickflow_common::{EngineError, ScalarValue};

/// Index of a node within its owning graph.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Node role. Push and pull sources carry the source bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeTypeFlags: u8 {
        const SOURCE      = 0b0000_0001;
        const PUSH_SOURCE = 0b0000_0011;
        const PULL_SOURCE = 0b0000_0101;
        const COMPUTE     = 0b0000_1000;
        const SINK        = 0b0001_0000;
    }
}

bitflags! {
    /// Engine services a node declares it consumes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Injectables: u16 {
        const STATE            = 0b0000_0001;
        const RECORDABLE_STATE = 0b0000_0010;
        const SCHEDULER        = 0b0000_0100;
        const OUTPUT           = 0b0000_1000;
        const CLOCK            = 0b0001_0000;
        const ENGINE           = 0b0010_0000;
        const LOGGER           = 0b0100_0000;
        const NODE             = 0b1000_0000;
        const TRAIT            = 0b1_0000_0000;
    }
}

impl NodeTypeFlags {
    pub fn is_source(self) -> bool {
        self.contains(Self::SOURCE)
    }

    pub fn is_push_source(self) -> bool {
        self.contains(Self::PUSH_SOURCE)
    }

    pub fn is_pull_source(self) -> bool {
        self.contains(Self::PULL_SOURCE)
    }

    pub fn is_compute(self) -> bool {
        self.contains(Self::COMPUTE)
    }

    pub fn is_sink(self) -> bool {
        self.contains(Self::SINK)
    }
}

/// Everything the engine needs to know about a node besides its behaviour.
#[derive(Debug, Clone)]
pub struct NodeSignature {
    pub name: String,
    pub node_type: NodeTypeFlags,
    /// Declaration order of every argument, time-series and scalar alike.
    pub args: Vec<String>,
    /// Time-series inputs in input order (a subset of `args`).
    pub time_series_inputs: Vec<(String, Schema)>,
    pub output: Option<Schema>,
    pub scalars: FxHashMap<String, ScalarValue>,
    /// Inputs made active on start; `None` means all of them.
    pub active_inputs: Option<FxHashSet<String>>,
    /// Inputs that must be valid before eval; `None` means all non-context.
    pub valid_inputs: Option<FxHashSet<String>>,
    /// Inputs that must additionally be all-valid.
    pub all_valid_inputs: Option<FxHashSet<String>>,
    /// Inputs tracked for context only, excluded from the default valid set.
    pub context_inputs: FxHashSet<String>,
    pub injectables: Injectables,
    pub capture_exception: bool,
    pub trace_back_depth: usize,
    pub wiring_path: String,
    pub label: Option<String>,
    pub record_replay_id: Option<String>,
    /// Schema of the recordable state bundle, when the node carries one.
    pub recordable_state_schema: Option<Schema>,
    pub has_nested_graphs: bool,
}

impl NodeSignature {
    pub fn new(name: impl Into<String>, node_type: NodeTypeFlags) -> Self {
        Self {
            name: name.into(),
            node_type,
            args: Vec::new(),
            time_series_inputs: Vec::new(),
            output: None,
            scalars: FxHashMap::default(),
            active_inputs: None,
            valid_inputs: None,
            all_valid_inputs: None,
            context_inputs: FxHashSet::default(),
            injectables: Injectables::default(),
            capture_exception: false,
            trace_back_depth: 8,
            wiring_path: String::new(),
            label: None,
            record_replay_id: None,
            recordable_state_schema: None,
            has_nested_graphs: false,
        }
    }

    pub fn uses_scheduler(&self) -> bool {
        self.injectables.contains(Injectables::SCHEDULER)
    }

    pub fn uses_recordable_state(&self) -> bool {
        self.injectables.contains(Injectables::RECORDABLE_STATE)
    }

    pub fn is_recordable(&self) -> bool {
        self.record_replay_id.is_some()
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.time_series_inputs.iter().position(|(n, _)| n == name)
    }

    /// `name(arg: TS[...], ...) -> TS[...]` rendering used in errors and
    /// diagnostics.
    pub fn signature(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if let Some(idx) = self.input_index(arg) {
                parts.push(format!("{arg}: {}", self.time_series_inputs[idx].1));
            } else if let Some(value) = self.scalars.get(arg) {
                parts.push(format!("{arg}={value}"));
            } else {
                parts.push(arg.clone());
            }
        }
        let mut rendered = format!("{}({})", self.name, parts.join(", "));
        if let Some(output) = &self.output {
            rendered.push_str(&format!(" -> {output}"));
        }
        rendered
    }

    /// `wiring_path.label-or-name`, the fully qualified node path.
    pub fn path(&self) -> String {
        let leaf = self.label.as_deref().unwrap_or(&self.name);
        if self.wiring_path.is_empty() {
            leaf.to_string()
        } else {
            format!("{}.{leaf}", self.wiring_path)
        }
    }
}

impl Display for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Lifecycle states; `eval` is only legal in `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialised,
    Starting,
    Started,
    Stopping,
    Stopped,
    Disposed,
}

impl LifecycleState {
    pub fn is_started(self) -> bool {
        self == Self::Started
    }

    pub fn is_starting(self) -> bool {
        self == Self::Starting
    }
}

/// User-facing node behaviour. `start` and `stop` default to no-ops; `eval`
/// is the node's work function and runs under the evaluation gate.
pub trait NodeBehaviour: Send {
    fn start(&mut self, _ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }

    fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError>;

    fn stop(&mut self, _ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Wrap a closure as a compute/sink behaviour.
pub fn behaviour_fn<F>(f: F) -> Box<dyn NodeBehaviour>
where
    F: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
{
    struct ClosureBehaviour<F>(F);

    impl<F> NodeBehaviour for ClosureBehaviour<F>
    where
        F: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
    {
        fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            (self.0)(ctx)
        }
    }

    Box::new(ClosureBehaviour(f))
}

/// Wrap start/eval/stop closures as a behaviour.
pub fn behaviour_with_lifecycle<S, E, T>(
    start: S,
    eval: E,
    stop: T,
) -> Box<dyn NodeBehaviour>
where
    S: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
    E: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
    T: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
{
    struct LifecycleBehaviour<S, E, T> {
        start: S,
        eval: E,
        stop: T,
    }

    impl<S, E, T> NodeBehaviour for LifecycleBehaviour<S, E, T>
    where
        S: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
        E: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
        T: FnMut(&mut NodeContext<'_>) -> Result<(), EngineError> + Send + 'static,
    {
        fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            (self.start)(ctx)
        }

        fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            (self.eval)(ctx)
        }

        fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            (self.stop)(ctx)
        }
    }

    Box::new(LifecycleBehaviour { start, eval, stop })
}

pub type SharedSignature = Arc<NodeSignature>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TsSchema;
    use tickflow_common::ScalarType;

    #[test]
    fn node_type_flags_nest() {
        assert!(NodeTypeFlags::PUSH_SOURCE.is_source());
        assert!(NodeTypeFlags::PULL_SOURCE.is_source());
        assert!(!NodeTypeFlags::COMPUTE.is_source());
        assert!(NodeTypeFlags::PUSH_SOURCE.is_push_source());
        assert!(!NodeTypeFlags::PULL_SOURCE.is_push_source());
    }

    #[test]
    fn signature_rendering() {
        let mut sig = NodeSignature::new("scale", NodeTypeFlags::COMPUTE);
        sig.args = vec!["x".into(), "factor".into()];
        sig.time_series_inputs = vec![("x".into(), TsSchema::scalar(ScalarType::Int))];
        sig.scalars.insert("factor".into(), ScalarValue::Int(2));
        sig.output = Some(TsSchema::scalar(ScalarType::Int));
        assert_eq!(sig.signature(), "scale(x: TS[int], factor=2) -> TS[int]");
    }

    #[test]
    fn path_prefers_label() {
        let mut sig = NodeSignature::new("calc", NodeTypeFlags::COMPUTE);
        sig.wiring_path = "root.sub".into();
        assert_eq!(sig.path(), "root.sub.calc");
        sig.label = Some("scaled".into());
        assert_eq!(sig.path(), "root.sub.scaled");
    }
}
