//! Views of the worker handed to steps during a callback

use std::time::Duration;

use serde_json::Value;

use crate::chain::{Chain, ChainId, TimeoutPolicy};
use crate::session::{SessionId, SharedSession};
use crate::step::{SharedStep, StepId};
use crate::trace::TraceContext;
use crate::worker::timer::TimerTarget;
use crate::worker::Worker;

/// What a step can reach while the worker is calling it back
pub struct StepContext<'a> {
    worker: &'a mut Worker,
    step: StepId,
    trace: TraceContext,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(worker: &'a mut Worker, step: StepId, trace: TraceContext) -> Self {
        Self {
            worker,
            step,
            trace,
        }
    }

    /// Id of the step being called back; pass it to [`Chain::check_ready`]
    pub fn step_id(&self) -> StepId {
        self.step
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn chain(&self, id: ChainId) -> Option<&Chain> {
        self.worker.chain(id)
    }

    pub fn chain_mut(&mut self, id: ChainId) -> Option<&mut Chain> {
        self.worker.chain_mut(id)
    }

    /// Chain of this step's trace registered under `name`
    pub fn find_chain(&self, name: &str) -> Option<ChainId> {
        self.worker.find_chain(&self.trace, name)
    }

    /// Create a chain for this trace with the configured timeout and policy
    pub fn create_chain(&mut self, name: &str) -> ChainId {
        let trace = self.trace.clone();
        self.worker.create_chain(trace, name)
    }

    pub fn create_chain_with(
        &mut self,
        name: &str,
        timeout: Duration,
        policy: TimeoutPolicy,
    ) -> ChainId {
        let trace = self.trace.clone();
        self.worker.create_chain_with(trace, name, timeout, policy)
    }

    /// Existing chain named `name` for this trace, or a new one
    pub fn obtain_chain(&mut self, name: &str) -> ChainId {
        match self.find_chain(name) {
            Some(id) => id,
            None => self.create_chain(name),
        }
    }

    /// Resume this step with `StepEvent::Timer` once `delay` has passed
    ///
    /// Returns false, arming nothing, when the deadline is past the clock's
    /// range.
    pub fn schedule(&mut self, delay: Duration) -> bool {
        let Some(deadline) = self.worker.deadline_after(delay) else {
            crate::trace_log!(
                &self.trace,
                WARN,
                "{} asked for a timer {:?} out, past the clock's range",
                self.step,
                delay
            );
            return false;
        };
        self.worker
            .timers
            .arm(deadline, TimerTarget::Step(self.step));
        true
    }

    /// Factory surface scoped to a chain, inheriting its trace
    pub fn scope(&mut self, chain: ChainId) -> Option<ChainScope<'_>> {
        ChainScope::new(self.worker, chain)
    }

    pub fn make_shared_step(&mut self, name: &str, args: &Value) -> Option<(StepId, SharedStep)> {
        self.worker.make_shared_step(&self.trace, name, args)
    }

    pub fn make_shared_session(
        &mut self,
        name: &str,
        args: &Value,
    ) -> Option<(SessionId, SharedSession)> {
        self.worker.make_shared_session(&self.trace, name, args)
    }
}

/// Step/session construction on behalf of one chain.
///
/// Objects built here carry the chain's trace and are held both by the
/// caller and by the worker's tables. Construction failure is `None`.
pub struct ChainScope<'a> {
    worker: &'a mut Worker,
    trace: TraceContext,
}

impl<'a> ChainScope<'a> {
    pub(crate) fn new(worker: &'a mut Worker, chain: ChainId) -> Option<Self> {
        let trace = worker.chain(chain)?.trace().clone();
        Some(Self { worker, trace })
    }

    /// Trace of the chain; use with [`trace_log!`](crate::trace_log)
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn make_shared_step(&mut self, name: &str, args: &Value) -> Option<(StepId, SharedStep)> {
        self.worker.make_shared_step(&self.trace, name, args)
    }

    pub fn make_shared_session(
        &mut self,
        name: &str,
        args: &Value,
    ) -> Option<(SessionId, SharedSession)> {
        self.worker.make_shared_session(&self.trace, name, args)
    }
}
