//! Nodes embedding subgraphs evaluate them on the shared clock.

use super::*;
use crate::builder::GraphBuilder;
use crate::graph::nested_graph_behaviour;
use crate::node::NodeId;
use tickflow_common::MIN_STEP;

#[test]
fn subgraph_ticks_ride_the_outer_clock() {
    let start = t(2_000);

    // Inner graph: a three-tick source feeding a collector.
    let mut inner = GraphBuilder::new_nested(&[], NodeId(0), "inner");
    let (src_sig, src) = scalar_source(
        "inner_src",
        vec![
            (start, 1),
            (start + MIN_STEP, 2),
            (start + MIN_STEP + MIN_STEP, 3),
        ],
    );
    let a = inner.add_node(src_sig, src);
    let out = trace();
    let (sink_sig, sink) = scalar_sink("inner_sink", out.clone());
    let b = inner.add_node(sink_sig, sink);
    inner.wire(a, b, "x");
    let inner_graph = inner.build().unwrap();
    assert_eq!(inner_graph.graph_id, vec![0]);

    // Outer graph: one node owning the subgraph.
    let mut outer = GraphBuilder::new("outer");
    let mut holder_sig = NodeSignature::new("holder", NodeTypeFlags::COMPUTE);
    holder_sig.has_nested_graphs = true;
    holder_sig.injectables = Injectables::SCHEDULER;
    outer.add_node(holder_sig, nested_graph_behaviour(inner_graph));

    run_simulation(outer, start, start + MIN_STEP + MIN_STEP).unwrap();

    assert_eq!(out.lock().clone(), vec![
        (start, ScalarValue::Int(1)),
        (start + MIN_STEP, ScalarValue::Int(2)),
        (start + MIN_STEP + MIN_STEP, ScalarValue::Int(3)),
    ]);
}
