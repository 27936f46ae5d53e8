//! Tickflow engine: a runtime for reactive time-series dataflow graphs.
//!
//! A graph of typed nodes exchanges timestamped values along bindings and is
//! evaluated either in historical simulation or against the wall clock. The
//! engine schedules node evaluations so each node observes a consistent
//! snapshot of its inputs at one logical time, tracks modifications
//! hierarchically through nested composite values, and exposes delta queries
//! so consumers process only what changed in the current tick.
//!
//! Layering, leaves first: schemas ([`schema`]) describe value shapes; the
//! arena ([`ts`]) stores values fused with their overlay state; bindings
//! ([`binding`]) connect inputs to outputs (peered, dereferenced, or
//! composite); [`feature`] synthesizes derived outputs from containers;
//! [`clock`] and [`scheduler`] order work in time; [`node`], [`graph`], and
//! [`engine`] run it.

pub mod binding;
pub mod builder;
pub mod clock;
pub mod engine;
pub mod feature;
pub mod graph;
pub mod node;
pub mod push;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod ts;

#[cfg(test)]
mod tests;

pub use builder::{GraphBuilder, OutputPath, OutputRoot};
pub use clock::{EvaluationClock, EvaluationMode, RealTimeClock};
pub use engine::{Engine, EngineHandle};
pub use graph::{
    Graph, LifecycleObserver, NodeContext, TsRef, nested_graph_behaviour,
};
pub use node::{
    Injectables, LifecycleState, NodeBehaviour, NodeId, NodeSignature, NodeTypeFlags,
    behaviour_fn, behaviour_with_lifecycle,
};
pub use push::{PushQueue, push_source_behaviour};
pub use record::Recorder;
pub use schema::{Schema, SchemaMatch, TsKind, TsSchema, WindowSpec, match_schemas};
pub use ts::{
    MapDeltaResult, PlainRef, PlainValue, RefValue, SetDeltaResult, compute_full_map_delta,
    compute_full_set_delta, compute_map_delta, compute_set_delta,
};

pub use tickflow_common::{
    EngineDelta, EngineError, EngineTime, HostObject, MAX_TIME, MIN_STEP, MIN_TIME, NodeError,
    ScalarType, ScalarValue,
};
