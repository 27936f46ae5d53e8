//! Push sources: external producers driving the real-time clock.
//!
//! A producer thread holds a [`PushQueue`] and enqueues values; each push
//! marks the real-time clock so the evaluation loop wakes and consumes the
//! event. The shared state is the only cross-thread resource in the engine.

use crate::clock::RealTimeClock;
use crate::ts::PlainValue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PushShared {
    queue: Mutex<VecDeque<PlainValue>>,
    /// Attached when the engine is constructed; pushes that arrive earlier
    /// are queued and picked up at the first cycle.
    clock: Mutex<Option<Arc<RealTimeClock>>>,
}

impl PushShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn attach_clock(&self, clock: Arc<RealTimeClock>) {
        *self.clock.lock() = Some(clock);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub(crate) fn pop(&self) -> Option<PlainValue> {
        self.queue.lock().pop_front()
    }

    /// Re-flag the clock; used when a node consumed one message and more
    /// remain.
    pub(crate) fn renotify(&self) {
        if let Some(clock) = self.clock.lock().as_ref() {
            clock.mark_push_node_requires_scheduling();
        }
    }

    fn push(&self, value: PlainValue) {
        self.queue.lock().push_back(value);
        self.renotify();
    }
}

/// Behaviour for a push-source node: consume one queued value per tick and
/// write it to the main output. Further pending values re-flag the clock, so
/// each message gets its own tick.
pub fn push_source_behaviour() -> Box<dyn crate::node::NodeBehaviour> {
    crate::node::behaviour_fn(|ctx| {
        if let Some(value) = ctx.push_pop() {
            ctx.set_output_plain(&value)?;
        }
        Ok(())
    })
}

/// Producer handle, cloneable to any thread.
#[derive(Debug, Clone)]
pub struct PushQueue {
    shared: Arc<PushShared>,
}

impl PushQueue {
    pub(crate) fn new(shared: Arc<PushShared>) -> Self {
        Self { shared }
    }

    pub fn push(&self, value: PlainValue) {
        self.shared.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickflow_common::EngineTime;

    #[test]
    fn pushes_queue_in_order() {
        let shared = PushShared::new();
        let queue = PushQueue::new(Arc::clone(&shared));
        assert!(!shared.has_pending());

        queue.push(PlainValue::scalar(1i64));
        queue.push(PlainValue::scalar(2i64));
        assert!(shared.has_pending());
        assert_eq!(shared.pop(), Some(PlainValue::scalar(1i64)));
        assert_eq!(shared.pop(), Some(PlainValue::scalar(2i64)));
        assert_eq!(shared.pop(), None);
    }

    #[test]
    fn push_marks_an_attached_clock() {
        let shared = PushShared::new();
        let clock = RealTimeClock::new(EngineTime::wall_clock_now());
        shared.attach_clock(Arc::clone(&clock));

        let queue = PushQueue::new(Arc::clone(&shared));
        queue.push(PlainValue::scalar(1i64));
        // The flag is retained behind the readiness gate.
        clock.reset_push_node_requires_scheduling();
        queue.push(PlainValue::scalar(2i64));
    }
}
