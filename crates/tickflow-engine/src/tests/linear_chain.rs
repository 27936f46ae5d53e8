//! Simulation chain: source → compute → sink over three ticks.

use super::*;
use tickflow_common::MIN_STEP;

fn doubler() -> (NodeSignature, Box<dyn NodeBehaviour>) {
    let mut sig = NodeSignature::new("double", NodeTypeFlags::COMPUTE);
    sig.args = vec!["x".into()];
    sig.time_series_inputs = vec![("x".into(), TsSchema::scalar(ScalarType::Int))];
    sig.output = Some(TsSchema::scalar(ScalarType::Int));

    let behaviour = behaviour_fn(|ctx| {
        if let Some(ScalarValue::Int(v)) = ctx.input_scalar("x")? {
            ctx.set_output(v * 2)?;
        }
        Ok(())
    });
    (sig, behaviour)
}

#[test]
fn scalar_passthrough_over_three_ticks() {
    let start = t(1_000);
    let mut builder = GraphBuilder::new("chain");

    let (src_sig, src) = scalar_source(
        "src",
        vec![(start, 1), (start + MIN_STEP, 2), (start + MIN_STEP + MIN_STEP, 3)],
    );
    let a = builder.add_node(src_sig, src);
    let (dbl_sig, dbl) = doubler();
    let b = builder.add_node(dbl_sig, dbl);
    let out = trace();
    let (sink_sig, sink) = scalar_sink("sink", out.clone());
    let c = builder.add_node(sink_sig, sink);

    builder.wire(a, b, "x");
    builder.wire(b, c, "x");

    run_simulation(builder, start, t(1_003)).unwrap();

    let collected = out.lock().clone();
    assert_eq!(collected, vec![
        (t(1_000), ScalarValue::Int(2)),
        (t(1_001), ScalarValue::Int(4)),
        (t(1_002), ScalarValue::Int(6)),
    ]);
}

#[test]
fn downstream_sees_writes_in_the_same_tick() {
    // Every hop of the chain runs within the tick of the source write: the
    // collected timestamps equal the source tick times exactly.
    let start = t(50);
    let mut builder = GraphBuilder::new("chain");
    let (src_sig, src) = scalar_source("src", vec![(start, 7)]);
    let a = builder.add_node(src_sig, src);
    let (dbl_sig, dbl) = doubler();
    let b = builder.add_node(dbl_sig, dbl);
    let out = trace();
    let (sink_sig, sink) = scalar_sink("sink", out.clone());
    let c = builder.add_node(sink_sig, sink);
    builder.wire(a, b, "x");
    builder.wire(b, c, "x");

    run_simulation(builder, start, start).unwrap();
    assert_eq!(out.lock().clone(), vec![(start, ScalarValue::Int(14))]);
}

#[test]
fn inactive_input_does_not_schedule_the_node() {
    let start = t(10);
    let mut builder = GraphBuilder::new("chain");
    let (src_sig, src) = scalar_source("src", vec![(start, 1), (start + MIN_STEP, 2)]);
    let a = builder.add_node(src_sig, src);

    let out = trace();
    let (mut sink_sig, sink) = scalar_sink("sink", out.clone());
    // No active inputs: the sink is never notified.
    sink_sig.active_inputs = Some(Default::default());
    let c = builder.add_node(sink_sig, sink);
    builder.wire(a, c, "x");

    run_simulation(builder, start, t(20)).unwrap();
    assert!(out.lock().is_empty());
}
