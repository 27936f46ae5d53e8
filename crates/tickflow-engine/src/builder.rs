//! Graph construction: staged node declarations, wiring edges, and the
//! build-time checks that surface every schema problem before `run` begins.

use crate::binding::InputSlot;
use crate::graph::{Graph, NodeCore, NodeSlot};
use crate::node::{LifecycleState, NodeBehaviour, NodeId, NodeSignature};
use crate::push::PushShared;
use crate::scheduler::NodeScheduler;
use crate::schema::{SchemaMatch, match_schemas};
use crate::ts::arena::{TsArena, TsId};
use crate::ts::data::OutputId;
use crate::schema::TsSchema;
use std::sync::Arc;
use tickflow_common::{EngineError, ScalarType};

/// Which of a node's outputs an edge reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoot {
    Main,
    Error,
    State,
}

/// Path to an output position: a root output, optionally descended through
/// bundle fields.
#[derive(Debug, Clone)]
pub struct OutputPath {
    pub root: OutputRoot,
    pub fields: Vec<String>,
}

impl OutputPath {
    pub fn main() -> Self {
        Self {
            root: OutputRoot::Main,
            fields: Vec::new(),
        }
    }

    pub fn error() -> Self {
        Self {
            root: OutputRoot::Error,
            fields: Vec::new(),
        }
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self {
            root: OutputRoot::Main,
            fields: vec![name.into()],
        }
    }
}

#[derive(Debug)]
struct Wire {
    src_node: usize,
    src_path: OutputPath,
    dst_node: usize,
    dst_input: String,
}

struct StagedNode {
    signature: NodeSignature,
    behaviour: Box<dyn NodeBehaviour>,
}

/// Staged graph under construction. Node order is evaluation order: ties on
/// scheduled time break by the index `add_node` returns.
pub struct GraphBuilder {
    graph_id: Vec<i64>,
    label: String,
    nodes: Vec<StagedNode>,
    wires: Vec<Wire>,
}

impl GraphBuilder {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            graph_id: Vec::new(),
            label: label.into(),
            nodes: Vec::new(),
            wires: Vec::new(),
        }
    }

    /// A builder for a subgraph embedded in `outer_node` of the graph at
    /// `outer_path`; node ids are prefixed for uniqueness.
    pub fn new_nested(
        outer_path: &[i64],
        outer_node: NodeId,
        label: impl Into<String>,
    ) -> Self {
        let mut graph_id = outer_path.to_vec();
        graph_id.push(outer_node.0 as i64);
        Self {
            graph_id,
            label: label.into(),
            nodes: Vec::new(),
            wires: Vec::new(),
        }
    }

    pub fn add_node(
        &mut self,
        signature: NodeSignature,
        behaviour: Box<dyn NodeBehaviour>,
    ) -> usize {
        self.nodes.push(StagedNode {
            signature,
            behaviour,
        });
        self.nodes.len() - 1
    }

    /// Wire `src`'s main output to `dst`'s input `input`.
    pub fn wire(&mut self, src: usize, dst: usize, input: impl Into<String>) {
        self.wire_path(src, OutputPath::main(), dst, input);
    }

    /// Wire from an explicit output path (error output, a bundle field, ...).
    pub fn wire_path(
        &mut self,
        src: usize,
        src_path: OutputPath,
        dst: usize,
        input: impl Into<String>,
    ) {
        self.wires.push(Wire {
            src_node: src,
            src_path,
            dst_node: dst,
            dst_input: input.into(),
        });
    }

    /// Materialize the graph: allocate every output, resolve every wire, and
    /// check schema compatibility and input coverage.
    pub fn build(self) -> Result<Graph, EngineError> {
        let mut arena = TsArena::new();
        let mut slots: Vec<NodeSlot> = Vec::with_capacity(self.nodes.len());
        let mut push_nodes = Vec::new();

        for (idx, staged) in self.nodes.into_iter().enumerate() {
            let id = NodeId(idx as u32);
            let signature = Arc::new(staged.signature);

            let output = signature
                .output
                .as_ref()
                .map(|schema| arena.alloc_value(schema, Some(id), OutputId::Main, None));
            let error_output = signature.capture_exception.then(|| {
                arena.alloc_value(
                    &TsSchema::scalar(ScalarType::Object),
                    Some(id),
                    OutputId::Error,
                    None,
                )
            });
            let recordable_state = signature
                .recordable_state_schema
                .as_ref()
                .map(|schema| arena.alloc_value(schema, Some(id), OutputId::State, None));

            let inputs: Vec<InputSlot> = signature
                .time_series_inputs
                .iter()
                .map(|(name, schema)| InputSlot::new(name.as_str(), schema.clone()))
                .collect();
            let wired = vec![None; inputs.len()];

            let check_valid = valid_check_indices(&signature);
            let check_all_valid = all_valid_check_indices(&signature);

            let push = signature.node_type.is_push_source().then(PushShared::new);
            if push.is_some() {
                push_nodes.push(id);
            }

            slots.push(NodeSlot {
                core: NodeCore {
                    id,
                    graph_path: self.graph_id.clone(),
                    signature,
                    state: LifecycleState::Created,
                    inputs,
                    wired,
                    output,
                    error_output,
                    recordable_state,
                    scheduler: NodeScheduler::new(),
                    check_valid,
                    check_all_valid,
                    push,
                },
                behaviour: Some(staged.behaviour),
            });
        }

        for wire in &self.wires {
            resolve_wire(&arena, &mut slots, wire)?;
        }

        // Every declared input must have exactly one edge.
        for slot in &slots {
            for (i, (name, _)) in slot.core.signature.time_series_inputs.iter().enumerate() {
                if slot.core.wired[i].is_none() {
                    return Err(EngineError::wiring(format!(
                        "input '{name}' of {} is unwired",
                        slot.core.signature.path()
                    )));
                }
            }
        }

        let mut graph = Graph::new(self.graph_id, self.label, slots, arena, push_nodes);
        mark_initialised(&mut graph);
        Ok(graph)
    }
}

fn mark_initialised(graph: &mut Graph) {
    for idx in 0..graph.node_count() {
        graph.nodes[idx].core.state = LifecycleState::Initialised;
    }
}

fn valid_check_indices(signature: &NodeSignature) -> Vec<u16> {
    match &signature.valid_inputs {
        Some(named) => signature
            .time_series_inputs
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| named.contains(name))
            .map(|(i, _)| i as u16)
            .collect(),
        None => signature
            .time_series_inputs
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| !signature.context_inputs.contains(name))
            .map(|(i, _)| i as u16)
            .collect(),
    }
}

fn all_valid_check_indices(signature: &NodeSignature) -> Vec<u16> {
    match &signature.all_valid_inputs {
        Some(named) => signature
            .time_series_inputs
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| named.contains(name))
            .map(|(i, _)| i as u16)
            .collect(),
        None => Vec::new(),
    }
}

fn resolve_wire(
    arena: &TsArena,
    slots: &mut [NodeSlot],
    wire: &Wire,
) -> Result<(), EngineError> {
    let src = slots
        .get(wire.src_node)
        .ok_or_else(|| EngineError::wiring(format!("unknown source node {}", wire.src_node)))?;
    let root = match wire.src_path.root {
        OutputRoot::Main => src.core.output,
        OutputRoot::Error => src.core.error_output,
        OutputRoot::State => src.core.recordable_state,
    }
    .ok_or_else(|| {
        EngineError::wiring(format!(
            "{} has no {:?} output",
            src.core.signature.path(),
            wire.src_path.root
        ))
    })?;

    let mut resolved: TsId = root;
    for field in &wire.src_path.fields {
        resolved = arena.child_by_name(resolved, field).ok_or_else(|| {
            EngineError::wiring(format!(
                "{} output has no field '{field}'",
                src.core.signature.path()
            ))
        })?;
    }
    let out_schema = arena.slot(resolved).schema.clone();
    let src_path = src.core.signature.path();

    let dst = slots
        .get_mut(wire.dst_node)
        .ok_or_else(|| EngineError::wiring(format!("unknown node {}", wire.dst_node)))?;
    let input_idx = dst
        .core
        .signature
        .input_index(&wire.dst_input)
        .ok_or_else(|| {
            EngineError::wiring(format!(
                "{} has no input '{}'",
                dst.core.signature.path(),
                wire.dst_input
            ))
        })?;
    if dst.core.wired[input_idx].is_some() {
        return Err(EngineError::wiring(format!(
            "input '{}' of {} is wired twice",
            wire.dst_input,
            dst.core.signature.path()
        )));
    }

    let in_schema = &dst.core.inputs[input_idx].schema;
    let compatible = match match_schemas(in_schema, &out_schema) {
        SchemaMatch::Mismatch => in_schema
            .deref_inner()
            .is_some_and(|inner| match_schemas(inner, &out_schema) == SchemaMatch::Peer),
        _ => true,
    };
    if !compatible {
        return Err(EngineError::wiring(format!(
            "cannot wire {src_path} ({out_schema}) into input '{}' of {} ({in_schema})",
            wire.dst_input,
            dst.core.signature.path()
        )));
    }

    dst.core.wired[input_idx] = Some(resolved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeTypeFlags, behaviour_fn};
    use tickflow_common::ScalarType;

    fn int_schema() -> crate::schema::Schema {
        TsSchema::scalar(ScalarType::Int)
    }

    fn source_signature(name: &str) -> NodeSignature {
        let mut sig = NodeSignature::new(name, NodeTypeFlags::PULL_SOURCE);
        sig.output = Some(int_schema());
        sig
    }

    fn sink_signature(name: &str) -> NodeSignature {
        let mut sig = NodeSignature::new(name, NodeTypeFlags::SINK);
        sig.args = vec!["x".into()];
        sig.time_series_inputs = vec![("x".into(), int_schema())];
        sig
    }

    #[test]
    fn build_resolves_wiring() {
        let mut b = GraphBuilder::new("main");
        let src = b.add_node(source_signature("src"), behaviour_fn(|_| Ok(())));
        let snk = b.add_node(sink_signature("snk"), behaviour_fn(|_| Ok(())));
        b.wire(src, snk, "x");

        let graph = b.build().unwrap();
        assert_eq!(graph.node_count(), 2);
        let src_out = graph.main_output(NodeId(0)).unwrap();
        assert_eq!(graph.node(NodeId(1)).wired[0], Some(src_out.0));
    }

    #[test]
    fn unwired_input_is_a_wiring_error() {
        let mut b = GraphBuilder::new("main");
        b.add_node(source_signature("src"), behaviour_fn(|_| Ok(())));
        b.add_node(sink_signature("snk"), behaviour_fn(|_| Ok(())));
        let err = b.build().unwrap_err();
        assert!(matches!(err, EngineError::Wiring(_)));
        assert!(err.to_string().contains("unwired"));
    }

    #[test]
    fn schema_mismatch_is_a_wiring_error() {
        let mut b = GraphBuilder::new("main");
        let mut src_sig = NodeSignature::new("src", NodeTypeFlags::PULL_SOURCE);
        src_sig.output = Some(TsSchema::scalar(ScalarType::Str));
        let src = b.add_node(src_sig, behaviour_fn(|_| Ok(())));
        let snk = b.add_node(sink_signature("snk"), behaviour_fn(|_| Ok(())));
        b.wire(src, snk, "x");
        assert!(matches!(b.build().unwrap_err(), EngineError::Wiring(_)));
    }

    #[test]
    fn double_wiring_is_rejected() {
        let mut b = GraphBuilder::new("main");
        let src = b.add_node(source_signature("src"), behaviour_fn(|_| Ok(())));
        let snk = b.add_node(sink_signature("snk"), behaviour_fn(|_| Ok(())));
        b.wire(src, snk, "x");
        b.wire(src, snk, "x");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("wired twice"));
    }

    #[test]
    fn bundle_field_wiring() {
        let mut b = GraphBuilder::new("main");
        let mut src_sig = NodeSignature::new("src", NodeTypeFlags::PULL_SOURCE);
        src_sig.output = Some(TsSchema::bundle([
            ("bid", int_schema()),
            ("ask", int_schema()),
        ]));
        let src = b.add_node(src_sig, behaviour_fn(|_| Ok(())));
        let snk = b.add_node(sink_signature("snk"), behaviour_fn(|_| Ok(())));
        b.wire_path(src, OutputPath::field("ask"), snk, "x");

        let graph = b.build().unwrap();
        let root = graph.main_output(NodeId(0)).unwrap();
        let ask = graph.arena().child_by_name(root.0, "ask").unwrap();
        assert_eq!(graph.node(NodeId(1)).wired[0], Some(ask));
    }

    #[test]
    fn nested_builder_prefixes_graph_ids() {
        let b = GraphBuilder::new_nested(&[2], NodeId(7), "inner");
        let graph = b.build().unwrap();
        assert_eq!(graph.graph_id, vec![2, 7]);
    }
}
