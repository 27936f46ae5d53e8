//! Evaluation clocks.
//!
//! Two variants behind one front: the simulation clock jumps straight to the
//! next scheduled time, the real-time clock waits on wall time and push
//! events. Only the real-time clock is built for cross-thread coordination;
//! push operations on the simulation clock are concurrency errors.

use crate::node::NodeId;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;
use tickflow_common::{
    EngineDelta, EngineError, EngineTime, MAX_TIME, MIN_STEP, MIN_TIME,
};

/// Which clock drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    Simulation,
    RealTime,
}

/// An alarm that came due during `advance_to_next_scheduled_time`. The engine
/// moves each fired alarm into the owning node's ordinary scheduled events,
/// so the normal advance loop picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredAlarm {
    pub node: NodeId,
    pub tag: String,
    pub time: EngineTime,
}

/* ───────────────────── simulation ───────────────────── */

#[derive(Debug)]
pub struct SimulationClock {
    evaluation_time: EngineTime,
    next_scheduled: EngineTime,
    wall_anchor: Instant,
}

impl SimulationClock {
    pub fn new(start_time: EngineTime) -> Self {
        Self {
            evaluation_time: start_time,
            next_scheduled: MAX_TIME,
            wall_anchor: Instant::now(),
        }
    }

    fn set_evaluation_time(&mut self, time: EngineTime) {
        self.evaluation_time = time;
        self.next_scheduled = MAX_TIME;
        self.wall_anchor = Instant::now();
    }

    fn cycle_time(&self) -> EngineDelta {
        EngineDelta::from_micros(self.wall_anchor.elapsed().as_micros() as i64)
    }
}

/* ───────────────────── real time ───────────────────── */

#[derive(Debug)]
struct RealTimeState {
    evaluation_time: EngineTime,
    next_scheduled: EngineTime,
    push_requires_scheduling: bool,
    /// Gate: pushes are only *consumed* once the clock has reached a wait
    /// state, so an early push is remembered, never dropped.
    ready_to_push: bool,
    last_time_allowed_push: EngineTime,
    alarms: BTreeSet<(EngineTime, u32, String)>,
}

/// Shared real-time clock. The engine holds it through
/// [`EvaluationClock::RealTime`]; push producers hold their own `Arc` and
/// call [`RealTimeClock::mark_push_node_requires_scheduling`] from any
/// thread.
#[derive(Debug)]
pub struct RealTimeClock {
    state: Mutex<RealTimeState>,
    push_condition: Condvar,
}

/// How long the ready-to-push gate may starve pushes before it is forced
/// open.
const PUSH_GATE_BACKSTOP: EngineDelta = EngineDelta::from_secs(15);

/// Upper bound on a single condvar wait slice.
const MAX_WAIT_SLICE: EngineDelta = EngineDelta::from_secs(10);

impl RealTimeClock {
    pub fn new(start_time: EngineTime) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RealTimeState {
                evaluation_time: start_time,
                next_scheduled: MAX_TIME,
                push_requires_scheduling: false,
                ready_to_push: false,
                last_time_allowed_push: MIN_TIME,
                alarms: BTreeSet::new(),
            }),
            push_condition: Condvar::new(),
        })
    }

    /// Called by push producers from any thread: flag the clock and wake the
    /// evaluation loop.
    pub fn mark_push_node_requires_scheduling(&self) {
        let mut state = self.state.lock();
        state.push_requires_scheduling = true;
        self.push_condition.notify_all();
    }

    pub fn push_node_requires_scheduling(&self) -> bool {
        let state = self.state.lock();
        state.ready_to_push && state.push_requires_scheduling
    }

    pub fn reset_push_node_requires_scheduling(&self) {
        self.state.lock().push_requires_scheduling = false;
    }

    fn set_alarm(
        &self,
        time: EngineTime,
        node: NodeId,
        tag: String,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if time <= state.evaluation_time {
            return Err(EngineError::scheduling(
                "cannot set an alarm in the engine's past",
            ));
        }
        // Same node+tag replaces the older alarm.
        let existing: Vec<(EngineTime, u32, String)> = state
            .alarms
            .iter()
            .filter(|(_, n, t)| *n == node.0 && *t == tag)
            .cloned()
            .collect();
        for entry in existing {
            state.alarms.remove(&entry);
        }
        state.alarms.insert((time, node.0, tag));
        Ok(())
    }

    fn cancel_alarm(&self, node: NodeId, tag: &str) {
        let mut state = self.state.lock();
        let stale: Vec<(EngineTime, u32, String)> = state
            .alarms
            .iter()
            .filter(|(_, n, t)| *n == node.0 && t.as_str() == tag)
            .cloned()
            .collect();
        for entry in stale {
            state.alarms.remove(&entry);
        }
    }

    fn advance(&self) -> Vec<FiredAlarm> {
        let mut fired = Vec::new();
        let mut state = self.state.lock();
        let mut next_scheduled = state.next_scheduled;
        let mut now = EngineTime::wall_clock_now();

        // Alarms already due adjust the target before any wait; a pending
        // alarm earlier than the target pulls the target forward.
        loop {
            let Some(first) = state.alarms.first().cloned() else {
                break;
            };
            if now >= first.0 {
                state.alarms.remove(&first);
                next_scheduled = next_scheduled.max(state.evaluation_time + MIN_STEP);
                fired.push(FiredAlarm {
                    node: NodeId(first.1),
                    tag: first.2,
                    time: next_scheduled,
                });
            } else if next_scheduled > first.0 {
                next_scheduled = first.0;
                break;
            } else {
                break;
            }
        }

        state.ready_to_push = false;
        let next_cycle = state.evaluation_time + MIN_STEP;
        if next_scheduled > next_cycle || now > state.last_time_allowed_push + PUSH_GATE_BACKSTOP {
            state.ready_to_push = true;
            state.last_time_allowed_push = now;

            loop {
                now = EngineTime::wall_clock_now();
                if now >= next_scheduled {
                    break;
                }
                if state.push_requires_scheduling {
                    break;
                }
                let sleep = (next_scheduled - now).min(MAX_WAIT_SLICE);
                self.push_condition
                    .wait_for(&mut state, sleep.to_chrono().to_std().unwrap_or_default());
                if state.push_requires_scheduling {
                    break;
                }
            }
        }

        state.evaluation_time = next_scheduled.min(next_cycle.max(now));
        state.next_scheduled = MAX_TIME;
        trace!(time = %state.evaluation_time, "real-time clock advanced");

        // Alarms that came due while waiting fire at the new evaluation time.
        loop {
            let Some(first) = state.alarms.first().cloned() else {
                break;
            };
            if now >= first.0 {
                state.alarms.remove(&first);
                fired.push(FiredAlarm {
                    node: NodeId(first.1),
                    tag: first.2,
                    time: state.evaluation_time,
                });
            } else {
                break;
            }
        }
        fired
    }
}

/* ───────────────────── the front ───────────────────── */

/// The engine-facing clock. Owns a [`SimulationClock`] outright or shares a
/// [`RealTimeClock`] with push producers.
#[derive(Debug)]
pub enum EvaluationClock {
    Simulation(SimulationClock),
    RealTime(Arc<RealTimeClock>),
}

impl EvaluationClock {
    pub fn new(mode: EvaluationMode, start_time: EngineTime) -> Self {
        match mode {
            EvaluationMode::Simulation => Self::Simulation(SimulationClock::new(start_time)),
            EvaluationMode::RealTime => Self::RealTime(RealTimeClock::new(start_time)),
        }
    }

    pub fn mode(&self) -> EvaluationMode {
        match self {
            Self::Simulation(_) => EvaluationMode::Simulation,
            Self::RealTime(_) => EvaluationMode::RealTime,
        }
    }

    /// The shared handle push producers clone, in real-time mode.
    pub fn real_time_handle(&self) -> Option<Arc<RealTimeClock>> {
        match self {
            Self::Simulation(_) => None,
            Self::RealTime(clock) => Some(Arc::clone(clock)),
        }
    }

    pub fn evaluation_time(&self) -> EngineTime {
        match self {
            Self::Simulation(c) => c.evaluation_time,
            Self::RealTime(c) => c.state.lock().evaluation_time,
        }
    }

    pub fn set_evaluation_time(&mut self, time: EngineTime) {
        match self {
            Self::Simulation(c) => c.set_evaluation_time(time),
            Self::RealTime(c) => {
                let mut state = c.state.lock();
                state.evaluation_time = time;
                state.next_scheduled = MAX_TIME;
            }
        }
    }

    /// Wall-clock "now": simulated from the cycle anchor in simulation mode,
    /// the actual wall clock in real-time mode.
    pub fn now(&self) -> EngineTime {
        match self {
            Self::Simulation(c) => c.evaluation_time + c.cycle_time(),
            Self::RealTime(_) => EngineTime::wall_clock_now(),
        }
    }

    /// Time spent in the current cycle so far.
    pub fn cycle_time(&self) -> EngineDelta {
        match self {
            Self::Simulation(c) => c.cycle_time(),
            Self::RealTime(c) => EngineTime::wall_clock_now() - c.state.lock().evaluation_time,
        }
    }

    pub fn next_cycle_evaluation_time(&self) -> EngineTime {
        self.evaluation_time() + MIN_STEP
    }

    pub fn next_scheduled_evaluation_time(&self) -> EngineTime {
        match self {
            Self::Simulation(c) => c.next_scheduled,
            Self::RealTime(c) => c.state.lock().next_scheduled,
        }
    }

    /// Pull the next-scheduled target earlier, clamped to the next cycle. A
    /// time equal to the current evaluation time is this cycle's work and
    /// needs no scheduling.
    pub fn update_next_scheduled_evaluation_time(&mut self, scheduled: EngineTime) {
        let evaluation_time = self.evaluation_time();
        if scheduled == evaluation_time {
            return;
        }
        let next_cycle = evaluation_time + MIN_STEP;
        match self {
            Self::Simulation(c) => {
                c.next_scheduled = next_cycle.max(c.next_scheduled.min(scheduled));
            }
            Self::RealTime(c) => {
                let mut state = c.state.lock();
                state.next_scheduled = next_cycle.max(state.next_scheduled.min(scheduled));
            }
        }
    }

    /// Move the evaluation time forward. In simulation this is a jump; in
    /// real time it waits for wall time, an alarm, or a push event. Returns
    /// the alarms that came due.
    pub fn advance_to_next_scheduled_time(&mut self) -> Vec<FiredAlarm> {
        match self {
            Self::Simulation(c) => {
                let target = c.next_scheduled;
                c.set_evaluation_time(target);
                trace!(time = %target, "simulation clock advanced");
                Vec::new()
            }
            Self::RealTime(c) => c.advance(),
        }
    }

    pub fn mark_push_node_requires_scheduling(&self) -> Result<(), EngineError> {
        match self {
            Self::Simulation(_) => Err(EngineError::concurrency(
                "simulation mode does not support push nodes",
            )),
            Self::RealTime(c) => {
                c.mark_push_node_requires_scheduling();
                Ok(())
            }
        }
    }

    pub fn push_node_requires_scheduling(&self) -> bool {
        match self {
            Self::Simulation(_) => false,
            Self::RealTime(c) => c.push_node_requires_scheduling(),
        }
    }

    pub fn reset_push_node_requires_scheduling(&self) -> Result<(), EngineError> {
        match self {
            Self::Simulation(_) => Err(EngineError::concurrency(
                "simulation mode does not support push nodes",
            )),
            Self::RealTime(c) => {
                c.reset_push_node_requires_scheduling();
                Ok(())
            }
        }
    }

    pub fn set_alarm(
        &mut self,
        time: EngineTime,
        node: NodeId,
        tag: String,
    ) -> Result<(), EngineError> {
        match self {
            Self::Simulation(_) => Err(EngineError::scheduling(
                "wall-clock alarms require the real-time clock",
            )),
            Self::RealTime(c) => c.set_alarm(time, node, tag),
        }
    }

    pub fn cancel_alarm(&mut self, node: NodeId, tag: &str) -> Result<(), EngineError> {
        match self {
            Self::Simulation(_) => Err(EngineError::scheduling(
                "cannot cancel an alarm in simulation mode",
            )),
            Self::RealTime(c) => {
                c.cancel_alarm(node, tag);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(us: i64) -> EngineTime {
        EngineTime::from_micros(us)
    }

    #[test]
    fn simulation_advance_jumps_to_target() {
        let mut clock = EvaluationClock::new(EvaluationMode::Simulation, t(100));
        clock.update_next_scheduled_evaluation_time(t(500));
        clock.advance_to_next_scheduled_time();
        assert_eq!(clock.evaluation_time(), t(500));
        // Advancing resets the target.
        assert_eq!(clock.next_scheduled_evaluation_time(), MAX_TIME);
    }

    #[test]
    fn next_scheduled_clamps_to_next_cycle() {
        let mut clock = EvaluationClock::new(EvaluationMode::Simulation, t(100));
        // Current-cycle times need no scheduling.
        clock.update_next_scheduled_evaluation_time(t(100));
        assert_eq!(clock.next_scheduled_evaluation_time(), MAX_TIME);
        // The past clamps forward to the next cycle.
        clock.update_next_scheduled_evaluation_time(t(50));
        assert_eq!(clock.next_scheduled_evaluation_time(), t(101));
        // The earliest future time wins.
        clock.update_next_scheduled_evaluation_time(t(400));
        clock.update_next_scheduled_evaluation_time(t(300));
        assert_eq!(clock.next_scheduled_evaluation_time(), t(300));
    }

    #[test]
    fn simulation_rejects_push_and_alarms() {
        let mut clock = EvaluationClock::new(EvaluationMode::Simulation, t(0));
        assert!(clock.mark_push_node_requires_scheduling().is_err());
        assert!(clock.set_alarm(t(10), NodeId(0), "x".into()).is_err());
        assert!(clock.cancel_alarm(NodeId(0), "x").is_err());
        assert!(!clock.push_node_requires_scheduling());
    }

    #[test]
    fn push_before_ready_is_remembered() {
        let clock = RealTimeClock::new(t(0));
        // Push arrives before the loop ever reaches a wait state.
        clock.mark_push_node_requires_scheduling();
        // Not consumable until the gate opens...
        assert!(!clock.push_node_requires_scheduling());
        // ...but the flag is retained and visible once it does.
        clock.state.lock().ready_to_push = true;
        assert!(clock.push_node_requires_scheduling());
    }

    #[test]
    fn alarm_same_tag_replaces() {
        let clock = RealTimeClock::new(t(0));
        let future = EngineTime::wall_clock_now() + EngineDelta::from_secs(3600);
        clock.set_alarm(future, NodeId(1), "a".into()).unwrap();
        clock
            .set_alarm(future + MIN_STEP, NodeId(1), "a".into())
            .unwrap();
        assert_eq!(clock.state.lock().alarms.len(), 1);

        clock.cancel_alarm(NodeId(1), "a");
        assert!(clock.state.lock().alarms.is_empty());
    }

    #[test]
    fn alarm_in_the_past_is_a_scheduling_error() {
        let clock = RealTimeClock::new(EngineTime::wall_clock_now());
        assert!(clock.set_alarm(MIN_TIME + MIN_STEP, NodeId(0), "x".into()).is_err());
    }

    #[test]
    fn real_time_push_wakes_the_wait() {
        let mut clock = EvaluationClock::RealTime(RealTimeClock::new(EngineTime::wall_clock_now()));
        let handle = clock.real_time_handle().unwrap();
        let far = EngineTime::wall_clock_now() + EngineDelta::from_secs(30);
        clock.update_next_scheduled_evaluation_time(far);

        let pusher = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.mark_push_node_requires_scheduling();
        });
        let started = Instant::now();
        clock.advance_to_next_scheduled_time();
        pusher.join().unwrap();
        // Returned on the push, not the 30s target.
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert!(clock.push_node_requires_scheduling());
    }
}
