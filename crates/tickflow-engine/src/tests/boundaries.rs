//! Boundary behaviors of the clock, scheduler, and containers.

use super::*;
use parking_lot::Mutex as PMutex;
use tickflow_common::MIN_STEP;

#[test]
fn end_equal_to_start_runs_exactly_one_tick() {
    let start = t(10);
    let mut builder = GraphBuilder::new("bounds");
    let (src_sig, src) = scalar_source("src", vec![(start, 1), (start + MIN_STEP, 2)]);
    let a = builder.add_node(src_sig, src);
    let out = trace();
    let (sink_sig, sink) = scalar_sink("sink", out.clone());
    let c = builder.add_node(sink_sig, sink);
    builder.wire(a, c, "x");

    run_simulation(builder, start, start).unwrap();
    assert_eq!(out.lock().clone(), vec![(start, ScalarValue::Int(1))]);
}

#[test]
fn schedule_now_is_a_no_op_and_next_step_fires() {
    let start = t(20);
    let count: Arc<PMutex<u32>> = Arc::new(PMutex::new(0));
    let count_inner = Arc::clone(&count);

    let mut builder = GraphBuilder::new("bounds");
    let mut sig = NodeSignature::new("ticker", NodeTypeFlags::COMPUTE);
    sig.injectables = Injectables::SCHEDULER;
    builder.add_node(
        sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                Ok(())
            },
            move |ctx| {
                let evals = {
                    let mut count = count_inner.lock();
                    *count += 1;
                    *count
                };
                if evals == 1 {
                    // A no-op: `when == evaluation_time` once started.
                    ctx.schedule_at(ctx.evaluation_time(), None);
                    // Runs on the very next tick.
                    ctx.schedule_after(MIN_STEP, None);
                }
                Ok(())
            },
            |_| Ok(()),
        ),
    );

    run_simulation(builder, start, t(30)).unwrap();
    assert_eq!(*count.lock(), 2);
}

#[test]
fn clear_on_empty_map_still_marks_modified() {
    let start = t(5);
    let map = TsSchema::map(ScalarType::Str, TsSchema::scalar(ScalarType::Int));

    let mut builder = GraphBuilder::new("bounds");
    let mut writer_sig = NodeSignature::new("writer", NodeTypeFlags::PULL_SOURCE);
    writer_sig.output = Some(map.clone());
    writer_sig.injectables = Injectables::SCHEDULER;
    let writer = builder.add_node(
        writer_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                Ok(())
            },
            |ctx| ctx.output_map_clear(),
            |_| Ok(()),
        ),
    );

    let seen: Arc<PMutex<Vec<(EngineTime, bool)>>> = Arc::new(PMutex::new(Vec::new()));
    let seen_inner = Arc::clone(&seen);
    let mut sink_sig = NodeSignature::new("sink", NodeTypeFlags::SINK);
    sink_sig.args = vec!["m".into()];
    sink_sig.time_series_inputs = vec![("m".into(), map)];
    let sink = builder.add_node(
        sink_sig,
        behaviour_fn(move |ctx| {
            seen_inner
                .lock()
                .push((ctx.evaluation_time(), ctx.input_modified("m")?));
            Ok(())
        }),
    );
    builder.wire(writer, sink, "m");

    run_simulation(builder, start, start).unwrap();
    assert_eq!(seen.lock().clone(), vec![(start, true)]);
}

#[test]
fn containers_are_invalid_until_first_modification() {
    let start = t(5);
    let second = start + MIN_STEP;
    let set = TsSchema::set(ScalarType::Int);

    let mut builder = GraphBuilder::new("bounds");
    let mut writer_sig = NodeSignature::new("writer", NodeTypeFlags::PULL_SOURCE);
    writer_sig.output = Some(set.clone());
    writer_sig.injectables = Injectables::SCHEDULER;
    let writer = builder.add_node(
        writer_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(second, None);
                Ok(())
            },
            |ctx| ctx.output_set_add(1i64).map(|_| ()),
            |_| Ok(()),
        ),
    );

    // The probe opts out of the default valid gate so it can observe the
    // not-yet-valid input.
    let seen: Arc<PMutex<Vec<(EngineTime, bool)>>> = Arc::new(PMutex::new(Vec::new()));
    let seen_inner = Arc::clone(&seen);
    let mut probe_sig = NodeSignature::new("probe", NodeTypeFlags::SINK);
    probe_sig.args = vec!["s".into()];
    probe_sig.time_series_inputs = vec![("s".into(), set)];
    probe_sig.valid_inputs = Some(Default::default());
    probe_sig.injectables = Injectables::SCHEDULER;
    let probe = builder.add_node(
        probe_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                Ok(())
            },
            move |ctx| {
                seen_inner
                    .lock()
                    .push((ctx.evaluation_time(), ctx.input_valid("s")?));
                Ok(())
            },
            |_| Ok(()),
        ),
    );
    builder.wire(writer, probe, "s");

    run_simulation(builder, start, second).unwrap();
    assert_eq!(seen.lock().clone(), vec![(start, false), (second, true)]);
}

#[test]
fn default_valid_gate_holds_back_eval() {
    let start = t(5);
    let second = start + MIN_STEP;

    let mut builder = GraphBuilder::new("bounds");
    // Emits only at the second tick; the sink's default valid gate skips the
    // first tick entirely even though the sink is scheduled for it.
    let (src_sig, src) = scalar_source("src", vec![(second, 9)]);
    let a = builder.add_node(src_sig, src);

    let evals: Arc<PMutex<Vec<EngineTime>>> = Arc::new(PMutex::new(Vec::new()));
    let evals_inner = Arc::clone(&evals);
    let mut sink_sig = NodeSignature::new("sink", NodeTypeFlags::SINK);
    sink_sig.args = vec!["x".into()];
    sink_sig.time_series_inputs = vec![("x".into(), TsSchema::scalar(ScalarType::Int))];
    sink_sig.injectables = Injectables::SCHEDULER;
    let sink = builder.add_node(
        sink_sig,
        behaviour_with_lifecycle(
            move |ctx| {
                ctx.schedule_at(start, None);
                Ok(())
            },
            move |ctx| {
                evals_inner.lock().push(ctx.evaluation_time());
                Ok(())
            },
            |_| Ok(()),
        ),
    );
    builder.wire(a, sink, "x");

    run_simulation(builder, start, second).unwrap();
    assert_eq!(evals.lock().clone(), vec![second]);
}
