//! The evaluation engine: owns the graph and the clock, and drives cycles
//! from start time to end time.

use crate::clock::{EvaluationClock, EvaluationMode, RealTimeClock};
use crate::graph::{Graph, LifecycleObserver, evaluate_graph, start_graph, stop_graph};
use crate::push::PushQueue;
use crate::record::Recorder;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tickflow_common::{EngineError, EngineTime, MIN_STEP};
use tracing::{debug, info};

/// Cross-thread control handle: request a stop from anywhere.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    stop: Arc<AtomicBool>,
    clock: Option<Arc<RealTimeClock>>,
}

impl EngineHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake a real-time clock that may be waiting out a long idle span.
        if let Some(clock) = &self.clock {
            clock.mark_push_node_requires_scheduling();
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.mode)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .finish_non_exhaustive()
    }
}

pub struct Engine {
    graph: Graph,
    clock: EvaluationClock,
    mode: EvaluationMode,
    start_time: EngineTime,
    end_time: EngineTime,
    stop: Arc<AtomicBool>,
    observers: Vec<Box<dyn LifecycleObserver>>,
    before_evaluation: Vec<Box<dyn FnOnce() + Send>>,
    after_evaluation: Vec<Box<dyn FnOnce() + Send>>,
    recorder: Option<Recorder>,
}

impl Engine {
    /// Build an engine over `graph`. Push sources are only legal against the
    /// real-time clock.
    pub fn new(
        graph: Graph,
        mode: EvaluationMode,
        start_time: EngineTime,
        end_time: EngineTime,
    ) -> Result<Self, EngineError> {
        if start_time > end_time {
            return Err(EngineError::wiring(format!(
                "start time {start_time} is after end time {end_time}"
            )));
        }
        if mode == EvaluationMode::Simulation && !graph.push_nodes.is_empty() {
            return Err(EngineError::concurrency(
                "push source nodes require the real-time clock",
            ));
        }
        let clock = EvaluationClock::new(mode, start_time);
        if let Some(shared_clock) = clock.real_time_handle() {
            for &node in &graph.push_nodes {
                if let Some(push) = &graph.node(node).push {
                    push.attach_clock(Arc::clone(&shared_clock));
                }
            }
        }
        Ok(Self {
            graph,
            clock,
            mode,
            start_time,
            end_time,
            stop: Arc::new(AtomicBool::new(false)),
            observers: Vec::new(),
            before_evaluation: Vec::new(),
            after_evaluation: Vec::new(),
            recorder: None,
        })
    }

    pub fn evaluation_mode(&self) -> EvaluationMode {
        self.mode
    }

    pub fn start_time(&self) -> EngineTime {
        self.start_time
    }

    pub fn end_time(&self) -> EngineTime {
        self.end_time
    }

    pub fn evaluation_time(&self) -> EngineTime {
        self.clock.evaluation_time()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            stop: Arc::clone(&self.stop),
            clock: self.clock.real_time_handle(),
        }
    }

    /// Producer handle for the push-source node named `name`.
    pub fn push_queue(&self, name: &str) -> Option<PushQueue> {
        for &node in &self.graph.push_nodes {
            let core = self.graph.node(node);
            if core.signature.name == name {
                return core.push.as_ref().map(|p| PushQueue::new(Arc::clone(p)));
            }
        }
        None
    }

    pub fn add_life_cycle_observer(&mut self, observer: Box<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    /// One-shot callback fired before the next cycle's evaluation.
    pub fn add_before_evaluation_notification(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.before_evaluation.push(f);
    }

    /// One-shot callback fired after the current cycle's evaluation, in
    /// reverse registration order.
    pub fn add_after_evaluation_notification(&mut self, f: Box<dyn FnOnce() + Send>) {
        self.after_evaluation.push(f);
    }

    pub fn set_recorder(&mut self, recorder: Recorder) {
        self.recorder = Some(recorder);
    }

    pub fn request_engine_stop(&self) {
        self.handle().request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run from start to end: start every node, evaluate cycles until the
    /// clock passes the end time (or a stop is requested), stop every node.
    /// Node stop/cleanup runs even when evaluation fails.
    pub fn run(&mut self) -> Result<(), EngineError> {
        info!(
            mode = ?self.mode,
            start = %self.start_time,
            end = %self.end_time,
            "engine run"
        );
        self.clock.set_evaluation_time(self.start_time);

        let started = {
            let Self {
                graph,
                clock,
                stop,
                observers,
                ..
            } = self;
            start_graph(graph, clock, stop, observers.as_mut_slice())
        };
        if let Err(e) = started {
            let _ = self.stop_all();
            return Err(e);
        }

        let result = self.run_cycles();
        let stopped = self.stop_all();
        self.graph.dispose();
        if let Some(recorder) = &mut self.recorder {
            recorder.flush()?;
        }
        result.and(stopped)
    }

    fn run_cycles(&mut self) -> Result<(), EngineError> {
        while self.clock.evaluation_time() <= self.end_time {
            self.notify_before_evaluation();
            {
                let Self {
                    graph,
                    clock,
                    stop,
                    observers,
                    recorder,
                    ..
                } = self;
                for observer in observers.iter_mut() {
                    observer.on_before_graph_evaluation(&graph.label);
                }
                evaluate_graph(graph, clock, stop, observers.as_mut_slice(), recorder.as_mut())?;
                for observer in observers.iter_mut() {
                    observer.on_after_graph_evaluation(&graph.label);
                }
            }
            self.notify_after_evaluation();
            self.advance_engine_time();
        }
        debug!(time = %self.clock.evaluation_time(), "engine loop complete");
        Ok(())
    }

    /// Move the clock to the next event. A requested stop advances past the
    /// end time, draining the loop.
    fn advance_engine_time(&mut self) {
        if self.stop.load(Ordering::SeqCst) {
            self.clock.set_evaluation_time(self.end_time + MIN_STEP);
            return;
        }
        self.clock
            .update_next_scheduled_evaluation_time(self.end_time + MIN_STEP);
        if let Some(next) = self.graph.next_scheduled_time() {
            self.clock.update_next_scheduled_evaluation_time(next);
        }
        let fired = self.clock.advance_to_next_scheduled_time();
        for alarm in fired {
            let head = self.graph.nodes[alarm.node.index()]
                .core
                .scheduler
                .on_alarm_fired(&alarm.tag, alarm.time);
            self.graph.evaluation_time = self.clock.evaluation_time();
            self.graph.schedule_node(alarm.node, head, false);
        }
    }

    fn stop_all(&mut self) -> Result<(), EngineError> {
        let Self {
            graph,
            clock,
            observers,
            ..
        } = self;
        stop_graph(graph, clock, observers.as_mut_slice())
    }

    /// Drain the one-shot pre-cycle callbacks; callbacks registered during
    /// the drain run in the same round.
    fn notify_before_evaluation(&mut self) {
        while !self.before_evaluation.is_empty() {
            let todo = std::mem::take(&mut self.before_evaluation);
            for f in todo {
                f();
            }
        }
    }

    /// Drain the one-shot post-cycle callbacks in reverse registration
    /// order; callbacks registered during the drain run in the same round.
    fn notify_after_evaluation(&mut self) {
        while !self.after_evaluation.is_empty() {
            let todo = std::mem::take(&mut self.after_evaluation);
            for f in todo.into_iter().rev() {
                f();
            }
        }
    }
}
