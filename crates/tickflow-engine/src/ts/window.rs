//! Rolling-history storage for window time-series.
//!
//! Two flavors behind one store: count-bounded (cyclic buffer, evicts the
//! oldest sample once full) and time-bounded (queue, evicts samples older
//! than the period relative to the newest push).

use crate::schema::WindowSpec;
use std::collections::VecDeque;
use tickflow_common::{EngineDelta, EngineTime, ScalarValue};

#[derive(Debug)]
pub struct WindowStorage {
    buf: VecDeque<(EngineTime, ScalarValue)>,
    bound: WindowSpec,
}

impl WindowStorage {
    pub fn new(bound: WindowSpec) -> Self {
        let buf = match bound {
            WindowSpec::Count(n) => VecDeque::with_capacity(n),
            WindowSpec::Period(_) => VecDeque::new(),
        };
        Self { buf, bound }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// A count-bounded window is full when it holds exactly its capacity.
    /// Time-bounded windows are never "full".
    pub fn is_full(&self) -> bool {
        match self.bound {
            WindowSpec::Count(n) => self.buf.len() == n,
            WindowSpec::Period(_) => false,
        }
    }

    pub fn bound(&self) -> WindowSpec {
        self.bound
    }

    /// Push a sample, evicting per the bound. Exactly-capacity pushes fill a
    /// count window without evicting; the capacity+1'th push evicts one.
    pub fn push(&mut self, time: EngineTime, value: ScalarValue) {
        match self.bound {
            WindowSpec::Count(n) => {
                if self.buf.len() == n {
                    self.buf.pop_front();
                }
                self.buf.push_back((time, value));
            }
            WindowSpec::Period(period) => {
                self.buf.push_back((time, value));
                self.evict_older_than(time, period);
            }
        }
    }

    fn evict_older_than(&mut self, now: EngineTime, period: EngineDelta) {
        while let Some(&(t, _)) = self.buf.front() {
            if now - t >= period && self.buf.len() > 1 {
                self.buf.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn first_modified_time(&self) -> Option<EngineTime> {
        self.buf.front().map(|&(t, _)| t)
    }

    pub fn samples(&self) -> impl Iterator<Item = &(EngineTime, ScalarValue)> {
        self.buf.iter()
    }

    pub fn snapshot(&self) -> Vec<(EngineTime, ScalarValue)> {
        self.buf.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&(EngineTime, ScalarValue)> {
        self.buf.back()
    }
}
