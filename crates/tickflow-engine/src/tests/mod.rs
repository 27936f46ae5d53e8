//! End-to-end scenarios driving the engine through the public surface.

mod boundaries;
mod deref_containers;
mod linear_chain;
mod nested_graphs;
mod ref_retarget;

use crate::builder::GraphBuilder;
use crate::clock::EvaluationMode;
use crate::engine::Engine;
use crate::node::{
    Injectables, NodeBehaviour, NodeSignature, NodeTypeFlags, behaviour_fn,
    behaviour_with_lifecycle,
};
use crate::schema::TsSchema;
use parking_lot::Mutex;
use std::sync::Arc;
use tickflow_common::{EngineTime, ScalarType, ScalarValue};

pub(crate) fn t(us: i64) -> EngineTime {
    EngineTime::from_micros(us)
}

pub(crate) type Trace = Arc<Mutex<Vec<(EngineTime, ScalarValue)>>>;

pub(crate) fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

/// A pull source that emits the given `(time, value)` ticks.
pub(crate) fn scalar_source(
    name: &str,
    ticks: Vec<(EngineTime, i64)>,
) -> (NodeSignature, Box<dyn NodeBehaviour>) {
    let mut sig = NodeSignature::new(name, NodeTypeFlags::PULL_SOURCE);
    sig.output = Some(TsSchema::scalar(ScalarType::Int));
    sig.injectables = Injectables::SCHEDULER;

    let schedule = ticks.clone();
    let behaviour = behaviour_with_lifecycle(
        move |ctx| {
            for (when, _) in &schedule {
                ctx.schedule_at(*when, None);
            }
            Ok(())
        },
        move |ctx| {
            let now = ctx.evaluation_time();
            if let Some((_, value)) = ticks.iter().find(|(when, _)| *when == now) {
                ctx.set_output(*value)?;
            }
            Ok(())
        },
        |_| Ok(()),
    );
    (sig, behaviour)
}

/// A sink collecting every modification of its scalar input into `out`.
pub(crate) fn scalar_sink(name: &str, out: Trace) -> (NodeSignature, Box<dyn NodeBehaviour>) {
    let mut sig = NodeSignature::new(name, NodeTypeFlags::SINK);
    sig.args = vec!["x".into()];
    sig.time_series_inputs = vec![("x".into(), TsSchema::scalar(ScalarType::Int))];

    let behaviour = behaviour_fn(move |ctx| {
        if ctx.input_modified("x")? {
            if let Some(value) = ctx.input_scalar("x")? {
                out.lock().push((ctx.evaluation_time(), value));
            }
        }
        Ok(())
    });
    (sig, behaviour)
}

pub(crate) fn run_simulation(
    builder: GraphBuilder,
    start: EngineTime,
    end: EngineTime,
) -> Result<Engine, tickflow_common::EngineError> {
    let graph = builder.build()?;
    let mut engine = Engine::new(graph, EvaluationMode::Simulation, start, end)?;
    engine.run()?;
    Ok(engine)
}
