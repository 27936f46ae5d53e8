//! Containers whose elements are references bind whole-container; element
//! reads dereference transparently and retarget deltas are recomputed
//! elementwise.

use super::*;
use crate::ts::{PlainValue, compute_map_delta};
use parking_lot::Mutex as PMutex;
use tickflow_common::MIN_STEP;

#[test]
fn map_of_refs_reads_as_a_plain_map() {
    let start = t(800);
    let second = start + MIN_STEP;
    let int = TsSchema::scalar(ScalarType::Int);
    let ref_map = TsSchema::map(ScalarType::Str, TsSchema::reference(int.clone()));
    let plain_map = TsSchema::map(ScalarType::Str, int);

    let mut builder = GraphBuilder::new("deref-maps");

    // Two scalar sources the map entries point at.
    let (x1_sig, x1) = scalar_source("x1", vec![(start, 10)]);
    let x1 = builder.add_node(x1_sig, x1);
    let (x2_sig, x2) = scalar_source("x2", vec![(start, 20)]);
    let x2 = builder.add_node(x2_sig, x2);

    // The router maintains a map of references: "a" → X1 at the first tick,
    // retargeted to X2 at the second.
    let mut router_sig = NodeSignature::new("router", NodeTypeFlags::COMPUTE);
    router_sig.output = Some(ref_map);
    router_sig.injectables = Injectables::SCHEDULER;
    let x1_idx = x1 as u32;
    let x2_idx = x2 as u32;
    let router = builder.add_node(
        router_sig,
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
                ctx.output_map_set_ref("a", output)
            },
            |_| Ok(()),
        ),
    );

    // The consumer expects a plain int-valued map; the edge is a
    // whole-container composite and element reads follow the references.
    let snapshots: Arc<PMutex<Vec<(EngineTime, PlainValue)>>> = Arc::new(PMutex::new(Vec::new()));
    let snapshots_inner = Arc::clone(&snapshots);
    let mut sink_sig = NodeSignature::new("sink", NodeTypeFlags::SINK);
    sink_sig.args = vec!["m".into()];
    sink_sig.time_series_inputs = vec![("m".into(), plain_map)];
    let sink = builder.add_node(
        sink_sig,
        behaviour_fn(move |ctx| {
            snapshots_inner
                .lock()
                .push((ctx.evaluation_time(), ctx.input_plain("m")?));
            Ok(())
        }),
    );
    builder.wire(router, sink, "m");

    run_simulation(builder, start, second).unwrap();

    let snapshots = snapshots.lock().clone();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(
        snapshots[0].1,
        PlainValue::Map(vec![("a".into(), PlainValue::scalar(10i64))])
    );
    // After the retarget the same key reads through X2.
    assert_eq!(
        snapshots[1].1,
        PlainValue::Map(vec![("a".into(), PlainValue::scalar(20i64))])
    );

    // The retarget delta is recomputed elementwise from the snapshots.
    let (PlainValue::Map(old), PlainValue::Map(new)) = (&snapshots[0].1, &snapshots[1].1) else {
        panic!("map snapshots expected");
    };
    let delta = compute_map_delta(old, new);
    assert!(delta.added.is_empty());
    assert!(delta.removed.is_empty());
    assert_eq!(
        delta.modified,
        vec![(ScalarValue::from("a"), PlainValue::scalar(20i64))]
    );
}
