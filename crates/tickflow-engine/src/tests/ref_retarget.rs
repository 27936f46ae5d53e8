//! Reference retargeting: a deref-bound consumer follows the reference's
//! current target and stops observing the old one.

use super::*;
use crate::binding::InputBinding;
use crate::node::NodeId;
use tickflow_common::MIN_STEP;

#[test]
fn consumer_follows_the_reference() {
    let start = t(500);
    let second = start + MIN_STEP;
    let third = second + MIN_STEP;
    let int = TsSchema::scalar(ScalarType::Int);

    let mut builder = GraphBuilder::new("refs");

    // X1 ticks 10 at T and 30 at T+2; X2 ticks 20 at T+1.
    let (x1_sig, x1) = scalar_source("x1", vec![(start, 10), (third, 30)]);
    let x1 = builder.add_node(x1_sig, x1);
    let (x2_sig, x2) = scalar_source("x2", vec![(second, 20)]);
    let x2 = builder.add_node(x2_sig, x2);

    // R points at X1 for the first tick, X2 from the second on.
    let mut ref_sig = NodeSignature::new("r", NodeTypeFlags::COMPUTE);
    ref_sig.output = Some(TsSchema::reference(int.clone()));
    ref_sig.injectables = Injectables::SCHEDULER;
    let x1_idx = x1 as u32;
    let x2_idx = x2 as u32;
    let r = builder.add_node(
        ref_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                ctx.schedule_at(second, None);
                Ok(())
            },
            move |ctx| {
                let target = if ctx.evaluation_time() == start {
                    x1_idx
                } else {
                    x2_idx
                };
                let output = ctx
                    .main_output_of(target)
                    .ok_or_else(|| tickflow_common::EngineError::internal("missing target"))?;
                ctx.set_output_ref(output)
            },
            |_| Ok(()),
        ),
    );

    let out = trace();
    let (y_sig, y) = scalar_sink("y", out.clone());
    let y = builder.add_node(y_sig, y);
    builder.wire(r, y, "x");

    let engine = run_simulation(builder, start, third + MIN_STEP).unwrap();

    // 10 at T (via X1), 20 at T+1 (rebound to X2), and X1's 30 at T+2 is
    // not observed.
    assert_eq!(out.lock().clone(), vec![
        (start, ScalarValue::Int(10)),
        (second, ScalarValue::Int(20)),
    ]);

    // The consumer's link ends on X2's output, and the reference output's
    // observer list still records it.
    let graph = engine.graph();
    let x2_out = graph.main_output(NodeId(1)).unwrap();
    let r_out = graph.main_output(NodeId(2)).unwrap();
    match &graph.node(NodeId(3)).inputs[0].binding {
        InputBinding::Unbound => {} // unbound by engine stop
        other => panic!("expected the stop to unbind, got {other:?}"),
    }
    // During the run the rebind left the reference pointing at X2.
    assert_eq!(graph.arena().ref_value(r_out.0).target(), Some(x2_out.0));
}

#[test]
fn clearing_the_reference_empties_the_link() {
    let start = t(10);
    let second = start + MIN_STEP;
    let int = TsSchema::scalar(ScalarType::Int);

    let mut builder = GraphBuilder::new("refs");
    let (x_sig, x) = scalar_source("x", vec![(start, 1), (second, 2)]);
    let x = builder.add_node(x_sig, x);

    let mut ref_sig = NodeSignature::new("r", NodeTypeFlags::COMPUTE);
    ref_sig.output = Some(TsSchema::reference(int));
    ref_sig.injectables = Injectables::SCHEDULER;
    let x_idx = x as u32;
    let r = builder.add_node(
        ref_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                ctx.schedule_at(second, None);
                Ok(())
            },
            move |ctx| {
                if ctx.evaluation_time() == start {
                    let output = ctx
                        .main_output_of(x_idx)
                        .ok_or_else(|| tickflow_common::EngineError::internal("missing target"))?;
                    ctx.set_output_ref(output)
                } else {
                    ctx.clear_output_ref()
                }
            },
            |_| Ok(()),
        ),
    );

    let out = trace();
    let (y_sig, y) = scalar_sink("y", out.clone());
    let y = builder.add_node(y_sig, y);
    builder.wire(r, y, "x");

    run_simulation(builder, start, second + MIN_STEP).unwrap();

    // The value at T arrives; after the clear, X's tick at T+1 is unseen.
    assert_eq!(out.lock().clone(), vec![(start, ScalarValue::Int(1))]);
}
