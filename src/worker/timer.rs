//! One-shot timers and the clock they are measured against

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::chain::ChainId;
use crate::step::StepId;

/// Time source for the worker
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to; clones share the same time
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Move time forward; a step past the clock's range leaves it unchanged
    pub fn advance(&self, by: Duration) {
        if let Some(later) = self.now.get().checked_add(by) {
            self.now.set(later);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// What to call when a timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Chain deadline: run its timeout hook
    Chain(ChainId),
    /// Step wake-up: resume with `StepEvent::Timer`
    Step(StepId),
}

/// Key of an armed timer; also what `cancel` takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Armed timers ordered by deadline, ties broken by arming order
#[derive(Debug, Default)]
pub struct TimerQueue {
    armed: BTreeMap<TimerId, TimerTarget>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, target: TimerTarget) -> TimerId {
        let id = TimerId {
            deadline,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.armed.insert(id, target);
        id
    }

    /// Disarm a timer. Returns false if it already fired or was canceled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerTarget)> {
        let (id, _) = self.armed.first_key_value()?;
        if id.deadline > now {
            return None;
        }
        self.armed.pop_first()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.keys().next().map(|id| id.deadline)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
