//! The graph: nodes, their slots in the arena, the schedule queue, and the
//! one-cycle evaluation driver.
//!
//! A node's behaviour is boxed and taken out of its slot for the duration of
//! a call, which leaves the rest of the graph freely borrowable by the
//! [`NodeContext`] handed to user code. Every write made through the context
//! drains its [`Effects`] before returning: reference rebinds first, then
//! node notifications into the queue. That makes retargeting synchronous
//! within the writer's call and keeps modification visibility to "later in
//! the same tick, or a later tick".

use crate::binding::{
    self, InputBinding, InputSlot, binding_all_valid, binding_last_modified, binding_modified,
    binding_plain, binding_resolved, binding_valid, reference,
};
use crate::clock::EvaluationClock;
use crate::node::error::{capture_node_error, enrich_node_error};
use crate::node::{LifecycleState, NodeBehaviour, NodeId, SharedSignature};
use crate::push::PushShared;
use crate::record::Recorder;
use crate::scheduler::{NodeScheduler, START_TAG, ScheduleQueue};
use crate::ts::arena::{Effects, TsArena, TsId};
use crate::ts::data::RefValue;
use crate::ts::delta::{MapDeltaResult, SetDeltaResult};
use crate::ts::plain::PlainValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tickflow_common::{
    EngineDelta, EngineError, EngineTime, MIN_STEP, MIN_TIME, ScalarValue,
};
use tracing::{debug, trace};

/// Observer of engine lifecycle events. All hooks default to no-ops.
pub trait LifecycleObserver: Send {
    fn on_before_start_graph(&mut self, _label: &str) {}
    fn on_after_start_graph(&mut self, _label: &str) {}
    fn on_before_start_node(&mut self, _path: &str) {}
    fn on_after_start_node(&mut self, _path: &str) {}
    fn on_before_graph_evaluation(&mut self, _label: &str) {}
    fn on_after_graph_evaluation(&mut self, _label: &str) {}
    fn on_after_push_nodes_evaluation(&mut self, _label: &str) {}
    fn on_before_node_evaluation(&mut self, _path: &str) {}
    fn on_after_node_evaluation(&mut self, _path: &str) {}
    fn on_before_stop_node(&mut self, _path: &str) {}
    fn on_after_stop_node(&mut self, _path: &str) {}
    fn on_before_stop_graph(&mut self, _label: &str) {}
    fn on_after_stop_graph(&mut self, _label: &str) {}
}

/// Opaque handle to a time-series slot, safe to hand to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsRef(pub(crate) TsId);

#[derive(Debug)]
pub struct NodeCore {
    pub id: NodeId,
    /// Owning graph id chain; nested graphs prefix their outer node's path.
    pub graph_path: Vec<i64>,
    pub signature: SharedSignature,
    pub state: LifecycleState,
    pub inputs: Vec<InputSlot>,
    /// Resolved wiring per input, bound at start.
    pub wired: Vec<Option<TsId>>,
    pub output: Option<TsId>,
    pub error_output: Option<TsId>,
    pub recordable_state: Option<TsId>,
    pub scheduler: NodeScheduler,
    /// Input indices checked for validity before eval.
    pub check_valid: Vec<u16>,
    /// Input indices additionally checked for all-validity.
    pub check_all_valid: Vec<u16>,
    pub push: Option<Arc<PushShared>>,
}

impl NodeCore {
    pub fn path(&self) -> String {
        self.signature.path()
    }

    /// Graph-qualified node id.
    pub fn node_id(&self) -> Vec<i64> {
        let mut id = self.graph_path.clone();
        id.push(self.id.0 as i64);
        id
    }
}

pub struct NodeSlot {
    pub core: NodeCore,
    pub behaviour: Option<Box<dyn NodeBehaviour>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("graph_id", &self.graph_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub struct Graph {
    pub graph_id: Vec<i64>,
    pub label: String,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) arena: TsArena,
    pub(crate) queue: ScheduleQueue,
    pub(crate) evaluation_time: EngineTime,
    in_cycle: bool,
    current_eval_index: u32,
    pub(crate) push_nodes: Vec<NodeId>,
}

impl Graph {
    pub(crate) fn new(
        graph_id: Vec<i64>,
        label: String,
        nodes: Vec<NodeSlot>,
        arena: TsArena,
        push_nodes: Vec<NodeId>,
    ) -> Self {
        let queue = ScheduleQueue::new(nodes.len());
        Self {
            graph_id,
            label,
            nodes,
            arena,
            queue,
            evaluation_time: MIN_TIME,
            in_cycle: false,
            current_eval_index: 0,
            push_nodes,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Final lifecycle transition; the graph is no longer runnable after.
    pub fn dispose(&mut self) {
        for slot in &mut self.nodes {
            slot.core.state = LifecycleState::Disposed;
        }
    }

    pub fn node(&self, id: NodeId) -> &NodeCore {
        &self.nodes[id.index()].core
    }

    pub fn arena(&self) -> &TsArena {
        &self.arena
    }

    pub fn main_output(&self, id: NodeId) -> Option<TsRef> {
        self.nodes[id.index()].core.output.map(TsRef)
    }

    pub fn error_output(&self, id: NodeId) -> Option<TsRef> {
        self.nodes[id.index()].core.error_output.map(TsRef)
    }

    pub fn next_scheduled_time(&mut self) -> Option<EngineTime> {
        self.queue.next_scheduled_time()
    }

    /// Register `node` at `when`, clamped to the present. Mid-cycle requests
    /// for a node whose turn has passed land on the next cycle.
    pub fn schedule_node(&mut self, node: NodeId, when: EngineTime, force: bool) {
        schedule_node_inner(
            &mut self.queue,
            self.evaluation_time,
            self.in_cycle,
            self.current_eval_index,
            node,
            when,
            force,
        );
    }
}

fn schedule_node_inner(
    queue: &mut ScheduleQueue,
    evaluation_time: EngineTime,
    in_cycle: bool,
    current_eval_index: u32,
    node: NodeId,
    when: EngineTime,
    force: bool,
) {
    let mut when = when.max(evaluation_time);
    if in_cycle && node.0 <= current_eval_index && when <= evaluation_time {
        when = evaluation_time + MIN_STEP;
    }
    queue.schedule(node, when, force);
}

/* ───────────────────── effects ───────────────────── */

fn process_effects(
    nodes: &mut [NodeSlot],
    arena: &mut TsArena,
    queue: &mut ScheduleQueue,
    evaluation_time: EngineTime,
    in_cycle: bool,
    current_eval_index: u32,
    fx: &mut Effects,
) {
    // Rebinds first: dependents must observe the new target before any
    // same-tick notification runs them.
    for req in std::mem::take(&mut fx.rebinds) {
        let node = req.observer.node;
        let input = req.observer.input as usize;
        if let Some(slot) = nodes
            .get_mut(node.index())
            .and_then(|n| n.core.inputs.get_mut(input))
        {
            reference::rebind_link(arena, node, slot, &req);
        }
    }
    for (node, time) in std::mem::take(&mut fx.notify) {
        let core = &mut nodes[node.index()].core;
        if core.state.is_started() || core.state.is_starting() {
            schedule_node_inner(
                queue,
                evaluation_time,
                in_cycle,
                current_eval_index,
                node,
                time.max(evaluation_time),
                false,
            );
        } else {
            // Pre-start notifications are replayed at the first eval.
            core.scheduler
                .schedule(MIN_TIME + MIN_STEP, Some(START_TAG), evaluation_time, false);
        }
    }
}

/* ───────────────────── node context ───────────────────── */

/// The view of the engine a node behaviour works against.
pub struct NodeContext<'g> {
    node: NodeId,
    nodes: &'g mut [NodeSlot],
    arena: &'g mut TsArena,
    queue: &'g mut ScheduleQueue,
    clock: &'g mut EvaluationClock,
    evaluation_time: EngineTime,
    in_cycle: bool,
    current_eval_index: u32,
    stop: &'g AtomicBool,
}

impl<'g> NodeContext<'g> {
    fn core(&self) -> &NodeCore {
        &self.nodes[self.node.index()].core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.nodes[self.node.index()].core
    }

    fn drain(&mut self, fx: &mut Effects) {
        process_effects(
            self.nodes,
            self.arena,
            self.queue,
            self.evaluation_time,
            self.in_cycle,
            self.current_eval_index,
            fx,
        );
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn node_path(&self) -> String {
        self.core().path()
    }

    /// The tick's logical time.
    pub fn evaluation_time(&self) -> EngineTime {
        self.evaluation_time
    }

    /// Wall-clock "now" per the active clock variant.
    pub fn now(&self) -> EngineTime {
        self.clock.now()
    }

    pub fn next_cycle_time(&self) -> EngineTime {
        self.evaluation_time + MIN_STEP
    }

    /// Request engine shutdown; the loop drains the current tick and exits.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /* ───────── inputs ───────── */

    fn input_idx(&self, name: &str) -> Result<usize, EngineError> {
        self.core().signature.input_index(name).ok_or_else(|| {
            EngineError::internal(format!(
                "{} has no input named '{name}'",
                self.core().signature.name
            ))
        })
    }

    pub fn input_valid(&self, name: &str) -> Result<bool, EngineError> {
        let idx = self.input_idx(name)?;
        Ok(binding_valid(self.arena, &self.core().inputs[idx].binding))
    }

    pub fn input_all_valid(&self, name: &str) -> Result<bool, EngineError> {
        let idx = self.input_idx(name)?;
        Ok(binding_all_valid(self.arena, &self.core().inputs[idx].binding))
    }

    pub fn input_modified(&self, name: &str) -> Result<bool, EngineError> {
        let idx = self.input_idx(name)?;
        Ok(binding_modified(
            self.arena,
            &self.core().inputs[idx].binding,
            self.evaluation_time,
        ))
    }

    pub fn input_last_modified(&self, name: &str) -> Result<EngineTime, EngineError> {
        let idx = self.input_idx(name)?;
        Ok(binding_last_modified(
            self.arena,
            &self.core().inputs[idx].binding,
        ))
    }

    pub fn input_scalar(&self, name: &str) -> Result<Option<ScalarValue>, EngineError> {
        let idx = self.input_idx(name)?;
        let slot = &self.core().inputs[idx];
        Ok(binding_resolved(&slot.binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
            .and_then(|ts| self.arena.scalar_value(ts)))
    }

    pub fn input_plain(&self, name: &str) -> Result<PlainValue, EngineError> {
        let idx = self.input_idx(name)?;
        let slot = &self.core().inputs[idx];
        Ok(binding_plain(self.arena, &slot.binding, &slot.schema))
    }

    /// The resolved slot behind an input, when it reads through one.
    pub fn input_ts(&self, name: &str) -> Result<Option<TsRef>, EngineError> {
        let idx = self.input_idx(name)?;
        Ok(binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| TsRef(reference::deref_ts(self.arena, ts))))
    }

    /// Field/element indices of a composite input modified this tick.
    pub fn input_modified_indices(&self, name: &str) -> Result<Vec<usize>, EngineError> {
        let idx = self.input_idx(name)?;
        let slot = &self.core().inputs[idx];
        match &slot.binding {
            InputBinding::Composite { children } => Ok(children
                .iter()
                .enumerate()
                .filter(|(_, c)| binding_modified(self.arena, c, self.evaluation_time))
                .map(|(i, _)| i)
                .collect()),
            binding => Ok(binding_resolved(binding)
                .map(|ts| self.arena.modified_indices(ts, self.evaluation_time))
                .unwrap_or_default()),
        }
    }

    /// This tick's structural delta of a set input; empty when none.
    pub fn input_set_delta(&mut self, name: &str) -> Result<SetDeltaResult, EngineError> {
        let idx = self.input_idx(name)?;
        let Some(ts) = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
        else {
            return Ok(SetDeltaResult::default());
        };
        if !self.arena.set_has_delta_at(ts, self.evaluation_time) {
            return Ok(SetDeltaResult::default());
        }
        Ok(SetDeltaResult {
            added: self.arena.set_added_values(ts),
            removed: self.arena.set_removed_values(ts),
        })
    }

    /// This tick's delta of a map input: added keys, removed keys with their
    /// buffered last values, and keys whose values ticked.
    pub fn input_map_delta(&mut self, name: &str) -> Result<MapDeltaResult, EngineError> {
        let idx = self.input_idx(name)?;
        let Some(ts) = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
        else {
            return Ok(MapDeltaResult::default());
        };
        let mut result = MapDeltaResult::default();
        if self.arena.map_has_delta_at(ts, self.evaluation_time) {
            for key in self.arena.map_added_keys(ts) {
                let value = self
                    .arena
                    .map_get(ts, &key)
                    .map(|child| self.arena.to_plain(child))
                    .unwrap_or(PlainValue::Empty);
                result.added.push((key, value));
            }
            result.removed = self
                .arena
                .map_removed(ts)
                .into_iter()
                .map(|(key, _)| key)
                .collect();
        }
        for index in self.arena.map_modified_key_indices(ts, self.evaluation_time) {
            if let Some(key) = self.arena.map_key_at(ts, index) {
                let value = self
                    .arena
                    .map_get(ts, &key)
                    .map(|child| self.arena.to_plain(child))
                    .unwrap_or(PlainValue::Empty);
                result.modified.push((key, value));
            }
        }
        Ok(result)
    }

    /// Buffered `(key, last value)` pairs removed from a map input this tick.
    pub fn input_map_removed(&mut self, name: &str) -> Result<Vec<(ScalarValue, PlainValue)>, EngineError> {
        let idx = self.input_idx(name)?;
        let Some(ts) = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
        else {
            return Ok(Vec::new());
        };
        if !self.arena.map_has_delta_at(ts, self.evaluation_time) {
            return Ok(Vec::new());
        }
        Ok(self
            .arena
            .map_removed(ts)
            .into_iter()
            .map(|(key, slot)| (key, self.arena.to_plain(slot)))
            .collect())
    }

    /* ───────── outputs ───────── */

    fn output_ts(&self) -> Result<TsId, EngineError> {
        self.core()
            .output
            .ok_or_else(|| EngineError::internal(format!("{} has no output", self.node_path())))
    }

    pub fn output_valid(&self) -> bool {
        self.core()
            .output
            .is_some_and(|ts| self.arena.valid(ts))
    }

    pub fn output_plain(&self) -> Result<PlainValue, EngineError> {
        Ok(self.arena.to_plain(self.output_ts()?))
    }

    pub fn set_output(&mut self, value: impl Into<ScalarValue>) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena
            .set_scalar(ts, value.into(), self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    pub fn set_output_plain(&mut self, value: &PlainValue) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena
            .set_from_plain(ts, value, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    pub fn set_output_field(
        &mut self,
        field: &str,
        value: impl Into<ScalarValue>,
    ) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let child = self
            .arena
            .child_by_name(ts, field)
            .ok_or_else(|| EngineError::internal(format!("output has no field '{field}'")))?;
        let mut fx = Effects::default();
        self.arena
            .set_scalar(child, value.into(), self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    pub fn invalidate_output(&mut self) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        self.arena.mark_invalid(ts);
        Ok(())
    }

    pub fn output_set_add(&mut self, value: impl Into<ScalarValue>) -> Result<bool, EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        let changed = self
            .arena
            .set_add(ts, value.into(), self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(changed)
    }

    pub fn output_set_remove(&mut self, value: &ScalarValue) -> Result<bool, EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        let changed = self.arena.set_remove(ts, value, self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(changed)
    }

    pub fn output_set_clear(&mut self) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena.set_clear(ts, self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(())
    }

    pub fn output_map_insert(
        &mut self,
        key: impl Into<ScalarValue>,
        value: &PlainValue,
    ) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        let child = self
            .arena
            .map_get_or_create(ts, &key.into(), self.evaluation_time, &mut fx)?;
        self.arena
            .set_from_plain(child, value, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    /// Point a reference-valued map entry at another output, creating the
    /// entry when absent.
    pub fn output_map_set_ref(
        &mut self,
        key: impl Into<ScalarValue>,
        target: TsRef,
    ) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        let child = self
            .arena
            .map_get_or_create(ts, &key.into(), self.evaluation_time, &mut fx)?;
        self.arena
            .set_ref(child, RefValue::Bound(target.0), self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(())
    }

    pub fn output_map_remove(&mut self, key: &ScalarValue) -> Result<bool, EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        let removed = self.arena.map_remove(ts, key, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(removed)
    }

    pub fn output_map_clear(&mut self) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena.map_clear(ts, self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(())
    }

    pub fn output_window_push(
        &mut self,
        value: impl Into<ScalarValue>,
    ) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena
            .window_push(ts, value.into(), self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    /// Point this node's reference output at another output.
    pub fn set_output_ref(&mut self, target: TsRef) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena
            .set_ref(ts, RefValue::Bound(target.0), self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(())
    }

    pub fn clear_output_ref(&mut self) -> Result<(), EngineError> {
        let ts = self.output_ts()?;
        let mut fx = Effects::default();
        self.arena
            .set_ref(ts, RefValue::Empty, self.evaluation_time, &mut fx);
        self.drain(&mut fx);
        Ok(())
    }

    /// Main output of a sibling node, for reference writers.
    pub fn main_output_of(&self, node: u32) -> Option<TsRef> {
        self.nodes
            .get(node as usize)
            .and_then(|n| n.core.output)
            .map(TsRef)
    }

    /// Pop one pending value from this push source's queue.
    pub fn push_pop(&mut self) -> Option<PlainValue> {
        self.core().push.as_ref().and_then(|p| p.pop())
    }

    /* ───────── recordable state ───────── */

    pub fn state_plain(&self) -> Result<PlainValue, EngineError> {
        let ts = self.core().recordable_state.ok_or_else(|| {
            EngineError::internal(format!("{} has no recordable state", self.node_path()))
        })?;
        Ok(self.arena.to_plain(ts))
    }

    pub fn set_state_plain(&mut self, value: &PlainValue) -> Result<(), EngineError> {
        let ts = self.core().recordable_state.ok_or_else(|| {
            EngineError::internal(format!("{} has no recordable state", self.node_path()))
        })?;
        let mut fx = Effects::default();
        self.arena
            .set_from_plain(ts, value, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(())
    }

    /* ───────── features ───────── */

    /// Request a `get_ref` feature on a map read through `input`; this node
    /// is the requester.
    pub fn input_map_get_ref(
        &mut self,
        input: &str,
        key: &ScalarValue,
    ) -> Result<TsRef, EngineError> {
        let idx = self.input_idx(input)?;
        let ts = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
            .ok_or_else(|| EngineError::binding(format!("input '{input}' is not bound")))?;
        let requester = self.node.0 as u64;
        let mut fx = Effects::default();
        let feature = self
            .arena
            .map_get_ref(ts, key, requester, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(TsRef(feature))
    }

    pub fn input_map_release_ref(
        &mut self,
        input: &str,
        key: &ScalarValue,
    ) -> Result<(), EngineError> {
        let idx = self.input_idx(input)?;
        if let Some(ts) = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
        {
            self.arena.map_release_get_ref(ts, key, self.node.0 as u64);
        }
        Ok(())
    }

    pub fn input_map_contains(
        &mut self,
        input: &str,
        key: &ScalarValue,
    ) -> Result<TsRef, EngineError> {
        let idx = self.input_idx(input)?;
        let ts = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
            .ok_or_else(|| EngineError::binding(format!("input '{input}' is not bound")))?;
        let requester = self.node.0 as u64;
        let mut fx = Effects::default();
        let feature = self
            .arena
            .map_contains(ts, key, requester, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(TsRef(feature))
    }

    pub fn input_map_is_empty(&mut self, input: &str) -> Result<TsRef, EngineError> {
        let idx = self.input_idx(input)?;
        let ts = binding_resolved(&self.core().inputs[idx].binding)
            .map(|ts| reference::deref_ts(self.arena, ts))
            .ok_or_else(|| EngineError::binding(format!("input '{input}' is not bound")))?;
        let mut fx = Effects::default();
        let feature = self.arena.map_is_empty(ts, self.evaluation_time, &mut fx)?;
        self.drain(&mut fx);
        Ok(TsRef(feature))
    }

    /// Subscribe this node to an arbitrary slot (feature outputs and the
    /// like); it is scheduled whenever the slot ticks.
    pub fn watch(&mut self, ts: TsRef) {
        self.arena.subscribe(ts.0, self.node);
    }

    pub fn unwatch(&mut self, ts: TsRef) {
        self.arena.unsubscribe(ts.0, self.node);
    }

    pub fn read_plain(&self, ts: TsRef) -> PlainValue {
        self.arena.to_plain(ts.0)
    }

    pub fn read_scalar(&self, ts: TsRef) -> Option<ScalarValue> {
        self.arena
            .scalar_value(reference::deref_ts(self.arena, ts.0))
    }

    /* ───────── scheduling ───────── */

    pub fn schedule_at(&mut self, when: EngineTime, tag: Option<&str>) {
        let node = self.node;
        let is_started = self.core().state.is_started();
        let evaluation_time = self.evaluation_time;
        if let Some(update) =
            self.core_mut()
                .scheduler
                .schedule(when, tag, evaluation_time, is_started)
        {
            schedule_node_inner(
                self.queue,
                self.evaluation_time,
                self.in_cycle,
                self.current_eval_index,
                node,
                update.head,
                update.force,
            );
        }
    }

    pub fn schedule_after(&mut self, delta: EngineDelta, tag: Option<&str>) {
        self.schedule_at(self.evaluation_time + delta, tag);
    }

    /// Schedule against the wall clock (real-time mode only). A tag is
    /// mandatory: wall-clock alarms are addressed by it.
    pub fn schedule_alarm(&mut self, when: EngineTime, tag: &str) -> Result<(), EngineError> {
        if tag.is_empty() {
            return Err(EngineError::scheduling(
                "wall-clock scheduling requires a tag",
            ));
        }
        let node = self.node;
        self.clock.set_alarm(when, node, tag.to_string())?;
        self.core_mut().scheduler.note_alarm(tag, when);
        Ok(())
    }

    pub fn unschedule(&mut self, tag: Option<&str>) {
        self.core_mut().scheduler.un_schedule(tag);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.core().scheduler.has_tag(tag)
    }

    pub fn pop_tag(&mut self, tag: &str) -> Option<EngineTime> {
        self.core_mut().scheduler.pop_tag(tag)
    }

    pub fn next_scheduled_time(&self) -> EngineTime {
        self.core().scheduler.next_scheduled_time()
    }

    /// Schedule this node at `max(time, evaluation_time)`.
    pub fn notify(&mut self, time: EngineTime) {
        let node = self.node;
        schedule_node_inner(
            self.queue,
            self.evaluation_time,
            self.in_cycle,
            self.current_eval_index,
            node,
            time.max(self.evaluation_time),
            false,
        );
    }

    pub fn notify_next_cycle(&mut self) {
        let node = self.node;
        let when = self.evaluation_time + MIN_STEP;
        schedule_node_inner(
            self.queue,
            self.evaluation_time,
            self.in_cycle,
            self.current_eval_index,
            node,
            when,
            false,
        );
    }

    /* ───────── nested graphs ───────── */

    /// Start an embedded subgraph against the same clock.
    pub fn start_nested(&mut self, nested: &mut Graph) -> Result<(), EngineError> {
        start_graph(nested, self.clock, self.stop, &mut [])
    }

    /// Evaluate an embedded subgraph for the current tick; returns the
    /// subgraph's next scheduled time so the outer node can follow it.
    pub fn evaluate_nested(
        &mut self,
        nested: &mut Graph,
    ) -> Result<Option<EngineTime>, EngineError> {
        evaluate_graph(nested, self.clock, self.stop, &mut [], None)?;
        Ok(nested.queue.next_scheduled_time())
    }

    pub fn stop_nested(&mut self, nested: &mut Graph) -> Result<(), EngineError> {
        stop_graph(nested, self.clock, &mut [])
    }
}

/// Behaviour wrapper for a node embedding a subgraph: evaluates it each tick
/// and keeps the outer node scheduled at the subgraph's next event.
pub fn nested_graph_behaviour(graph: Graph) -> Box<dyn NodeBehaviour> {
    struct NestedGraph {
        graph: Graph,
    }

    impl NodeBehaviour for NestedGraph {
        fn start(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            ctx.start_nested(&mut self.graph)?;
            if let Some(next) = self.graph.queue.next_scheduled_time() {
                ctx.schedule_at(next.max(ctx.evaluation_time()), None);
                ctx.notify(ctx.evaluation_time());
            }
            Ok(())
        }

        fn eval(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            if let Some(next) = ctx.evaluate_nested(&mut self.graph)? {
                ctx.schedule_at(next, None);
            }
            Ok(())
        }

        fn stop(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), EngineError> {
            ctx.stop_nested(&mut self.graph)
        }
    }

    Box::new(NestedGraph { graph })
}

/* ───────────────────── lifecycle drivers ───────────────────── */

fn with_behaviour<F>(
    graph: &mut Graph,
    idx: usize,
    clock: &mut EvaluationClock,
    stop: &AtomicBool,
    f: F,
) -> Result<(), EngineError>
where
    F: FnOnce(&mut dyn NodeBehaviour, &mut NodeContext<'_>) -> Result<(), EngineError>,
{
    let node = NodeId(idx as u32);
    let mut behaviour = graph.nodes[idx].behaviour.take().ok_or_else(|| {
        EngineError::internal(format!("behaviour missing for node {idx}"))
    })?;
    let result = {
        let Graph {
            nodes,
            arena,
            queue,
            evaluation_time,
            in_cycle,
            current_eval_index,
            ..
        } = graph;
        let mut ctx = NodeContext {
            node,
            nodes: nodes.as_mut_slice(),
            arena,
            queue,
            clock,
            evaluation_time: *evaluation_time,
            in_cycle: *in_cycle,
            current_eval_index: *current_eval_index,
            stop,
        };
        f(behaviour.as_mut(), &mut ctx)
    };
    graph.nodes[idx].behaviour = Some(behaviour);
    result
}

/// Start every node in index order: bind wired inputs, activate per the
/// signature, run user start, replay pre-start notifications.
pub fn start_graph(
    graph: &mut Graph,
    clock: &mut EvaluationClock,
    stop: &AtomicBool,
    observers: &mut [Box<dyn LifecycleObserver>],
) -> Result<(), EngineError> {
    graph.evaluation_time = clock.evaluation_time();
    for observer in observers.iter_mut() {
        observer.on_before_start_graph(&graph.label);
    }
    for idx in 0..graph.nodes.len() {
        let path = graph.nodes[idx].core.path();
        for observer in observers.iter_mut() {
            observer.on_before_start_node(&path);
        }
        start_node(graph, idx, clock, stop)?;
        for observer in observers.iter_mut() {
            observer.on_after_start_node(&path);
        }
    }
    for observer in observers.iter_mut() {
        observer.on_after_start_graph(&graph.label);
    }
    debug!(label = %graph.label, nodes = graph.nodes.len(), "graph started");
    Ok(())
}

fn start_node(
    graph: &mut Graph,
    idx: usize,
    clock: &mut EvaluationClock,
    stop: &AtomicBool,
) -> Result<(), EngineError> {
    let node = NodeId(idx as u32);
    {
        let Graph { nodes, arena, .. } = graph;
        let core = &mut nodes[idx].core;
        core.state = LifecycleState::Starting;

        for i in 0..core.inputs.len() {
            if let Some(output) = core.wired[i] {
                binding::bind_input(arena, node, i as u16, &mut core.inputs[i], output)?;
            }
        }
        let active_inputs = core.signature.active_inputs.clone();
        for slot in core.inputs.iter_mut() {
            let make_active = active_inputs
                .as_ref()
                .is_none_or(|set| set.contains(&*slot.name));
            if make_active {
                binding::set_input_active(arena, node, slot, true);
            }
        }
    }

    with_behaviour(graph, idx, clock, stop, |behaviour, ctx| {
        behaviour.start(ctx)
    })
    .map_err(|e| enrich_node_error(e, &graph.nodes[idx].core.signature.clone()))?;

    let core = &mut graph.nodes[idx].core;
    core.state = LifecycleState::Started;
    let replay_start = core.scheduler.pop_tag(START_TAG).is_some();
    let head = if core.scheduler.requires_scheduling() {
        Some(core.scheduler.next_scheduled_time())
    } else {
        None
    };
    let evaluation_time = graph.evaluation_time;
    if replay_start {
        graph.schedule_node(node, evaluation_time, false);
    }
    if let Some(head) = head {
        graph.schedule_node(node, head.max(evaluation_time), false);
    }
    trace!(node = idx, "node started");
    Ok(())
}

/// Stop every node in index order. Cleanup (unbind, alarm cancellation,
/// scheduler reset) runs even when user stop code fails; the first failure
/// is reported after cleanup completes.
pub fn stop_graph(
    graph: &mut Graph,
    clock: &mut EvaluationClock,
    observers: &mut [Box<dyn LifecycleObserver>],
) -> Result<(), EngineError> {
    for observer in observers.iter_mut() {
        observer.on_before_stop_graph(&graph.label);
    }
    let stop_flag = AtomicBool::new(false);
    let mut first_error = None;
    for idx in 0..graph.nodes.len() {
        let path = graph.nodes[idx].core.path();
        for observer in observers.iter_mut() {
            observer.on_before_stop_node(&path);
        }
        let was_running = {
            let state = graph.nodes[idx].core.state;
            state.is_started() || state.is_starting()
        };
        graph.nodes[idx].core.state = LifecycleState::Stopping;
        let result = if was_running {
            with_behaviour(graph, idx, clock, &stop_flag, |behaviour, ctx| {
                behaviour.stop(ctx)
            })
        } else {
            Ok(())
        };

        // Unconditional cleanup.
        let node = NodeId(idx as u32);
        {
            let Graph { nodes, arena, .. } = graph;
            let core = &mut nodes[idx].core;
            for i in 0..core.inputs.len() {
                binding::unbind_input(arena, node, i as u16, &mut core.inputs[i]);
            }
            for tag in core.scheduler.alarm_tags() {
                let _ = clock.cancel_alarm(node, &tag);
            }
            core.scheduler.reset();
            core.state = LifecycleState::Stopped;
        }

        if let Err(e) = result {
            let enriched = enrich_node_error(e, &graph.nodes[idx].core.signature.clone());
            first_error.get_or_insert(enriched);
        }
        for observer in observers.iter_mut() {
            observer.on_after_stop_node(&path);
        }
    }
    graph.queue.clear();
    for observer in observers.iter_mut() {
        observer.on_after_stop_graph(&graph.label);
    }
    debug!(label = %graph.label, "graph stopped");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/* ───────────────────── evaluation ───────────────────── */

/// Run one evaluation cycle at the clock's current time: the push pass, then
/// every due node in ascending index order (including nodes that become due
/// for this tick mid-cycle at a higher index).
pub fn evaluate_graph(
    graph: &mut Graph,
    clock: &mut EvaluationClock,
    stop: &AtomicBool,
    observers: &mut [Box<dyn LifecycleObserver>],
    mut recorder: Option<&mut Recorder>,
) -> Result<(), EngineError> {
    graph.evaluation_time = clock.evaluation_time();

    if clock.push_node_requires_scheduling() {
        clock.reset_push_node_requires_scheduling()?;
        let pending: Vec<NodeId> = graph
            .push_nodes
            .iter()
            .copied()
            .filter(|n| {
                graph.nodes[n.index()]
                    .core
                    .push
                    .as_ref()
                    .is_some_and(|p| p.has_pending())
            })
            .collect();
        for node in pending {
            eval_node(graph, node.index(), clock, stop, observers, recorder.as_deref_mut())?;
        }
        for observer in observers.iter_mut() {
            observer.on_after_push_nodes_evaluation(&graph.label);
        }
    }

    graph.in_cycle = true;
    let time = graph.evaluation_time;
    while let Some(node) = graph.queue.pop_due(time) {
        graph.current_eval_index = node.0;
        let result = eval_node(
            graph,
            node.index(),
            clock,
            stop,
            observers,
            recorder.as_deref_mut(),
        );
        if result.is_err() {
            graph.in_cycle = false;
            return result;
        }
    }
    graph.in_cycle = false;
    Ok(())
}

fn eval_node(
    graph: &mut Graph,
    idx: usize,
    clock: &mut EvaluationClock,
    stop: &AtomicBool,
    observers: &mut [Box<dyn LifecycleObserver>],
    recorder: Option<&mut Recorder>,
) -> Result<(), EngineError> {
    let node = NodeId(idx as u32);
    let time = graph.evaluation_time;

    let (should_eval, scheduled) = {
        let core = &graph.nodes[idx].core;
        if !core.state.is_started() {
            return Ok(());
        }
        let scheduled = core.scheduler.is_scheduled_now(time);

        let mut should = core
            .check_valid
            .iter()
            .all(|&i| binding_valid(&graph.arena, &core.inputs[i as usize].binding));
        if should && !core.check_all_valid.is_empty() {
            should = core
                .check_all_valid
                .iter()
                .all(|&i| binding_all_valid(&graph.arena, &core.inputs[i as usize].binding));
        }
        if should && core.signature.uses_scheduler() && !scheduled {
            should = core.inputs.is_empty()
                || core.inputs.iter().any(|slot| {
                    slot.active && binding_modified(&graph.arena, &slot.binding, time)
                });
        }
        (should, scheduled)
    };

    if should_eval {
        let path = graph.nodes[idx].core.path();
        for observer in observers.iter_mut() {
            observer.on_before_node_evaluation(&path);
        }
        let result = with_behaviour(graph, idx, clock, stop, |behaviour, ctx| {
            behaviour.eval(ctx)
        });
        for observer in observers.iter_mut() {
            observer.on_after_node_evaluation(&path);
        }

        if let Err(err) = result {
            let (capture, signature) = {
                let core = &graph.nodes[idx].core;
                (
                    core.signature.capture_exception
                        && core.error_output.is_some()
                        && !err.is_fatal(),
                    core.signature.clone(),
                )
            };
            if capture {
                let snapshot = render_input_snapshot(graph, idx);
                let captured = capture_node_error(&err, &signature, Some(snapshot));
                debug!(node = %signature.path(), "captured evaluation error");
                let error_output = graph.nodes[idx].core.error_output.ok_or_else(|| {
                    EngineError::internal("error output missing during capture")
                })?;
                let mut fx = Effects::default();
                graph.arena.set_scalar(
                    error_output,
                    ScalarValue::Object(Arc::new(captured)),
                    time,
                    &mut fx,
                )?;
                let Graph {
                    nodes,
                    arena,
                    queue,
                    evaluation_time,
                    in_cycle,
                    current_eval_index,
                    ..
                } = graph;
                process_effects(
                    nodes,
                    arena,
                    queue,
                    *evaluation_time,
                    *in_cycle,
                    *current_eval_index,
                    &mut fx,
                );
            } else {
                return Err(enrich_node_error(err, &signature));
            }
        }
    }

    // Scheduler advance: drop everything at or before this tick, re-register
    // the surviving head.
    {
        let core = &mut graph.nodes[idx].core;
        let next = if scheduled {
            core.scheduler.advance(time)
        } else if core.scheduler.requires_scheduling() {
            Some(core.scheduler.next_scheduled_time())
        } else {
            None
        };
        if let Some(next) = next {
            graph.schedule_node(node, next, false);
        }
    }

    // Push sources with further pending messages re-flag the clock.
    if let Some(push) = &graph.nodes[idx].core.push {
        if push.has_pending() {
            push.renotify();
        }
    }

    // Recordable state written this tick is persisted with its timestamp.
    if let Some(recorder) = recorder {
        let core = &graph.nodes[idx].core;
        if let (Some(id), Some(state)) =
            (core.signature.record_replay_id.clone(), core.recordable_state)
        {
            if graph.arena.modified_at(state, time) {
                let value = graph.arena.to_plain(state);
                recorder.record(&id, time, &value)?;
            }
        }
    }
    Ok(())
}

fn render_input_snapshot(graph: &Graph, idx: usize) -> String {
    let core = &graph.nodes[idx].core;
    let parts: Vec<String> = core
        .inputs
        .iter()
        .map(|slot| {
            let value = binding_plain(&graph.arena, &slot.binding, &slot.schema);
            format!("{}={}", slot.name, value.render())
        })
        .collect();
    parts.join(", ")
}
