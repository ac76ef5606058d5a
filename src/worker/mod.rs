//! Single-threaded worker driving steps, chains and their timers.
//!
//! The worker owns every table: steps and sessions by shared handle, chains by
//! value. It is the only component that calls a step back or destroys a chain.
//! Everything runs on one thread; the tables hold `Rc`s, so a worker and the
//! chains in it cannot be shared with another thread.
//!
//! After each callback the worker settles: steps created through the factory
//! are started, and every chain that became ready has its timer canceled and
//! its waiting queue resumed in FIFO order with [`StepEvent::ChainReady`].

pub mod context;
pub mod factory;
pub mod timer;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::{Chain, ChainId, TimeoutPolicy};
use crate::config::{ChainConfig, Config, WorkerConfig};
use crate::session::{SessionId, SharedSession};
use crate::step::{CmdStatus, SharedStep, Step, StepEvent, StepId};
use crate::trace::TraceContext;

pub use context::{ChainScope, StepContext};
pub use factory::Registry;
pub use timer::{Clock, ManualClock, SystemClock, TimerId, TimerQueue, TimerTarget};

/// Errors from dispatching into the worker's tables
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkerError {
    #[error("{0} not found")]
    StepNotFound(StepId),

    #[error("{0} not found")]
    ChainNotFound(ChainId),

    #[error("{0} is already running a callback")]
    StepBusy(StepId),
}

struct StepEntry {
    trace: TraceContext,
    step: SharedStep,
}

struct SessionEntry {
    trace: TraceContext,
    session: SharedSession,
}

struct ChainEntry {
    chain: Chain,
    timer: Option<TimerId>,
    timed_out: bool,
}

/// Counters kept over the worker's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub steps_started: usize,
    pub steps_done: usize,
    pub steps_failed: usize,
    pub steps_aborted: usize,
    pub wakes: usize,
    pub chains_created: usize,
    pub chains_timed_out: usize,
}

pub struct Worker {
    config: WorkerConfig,
    chain_defaults: ChainConfig,
    clock: Rc<dyn Clock>,
    registry: Registry,
    steps: BTreeMap<StepId, StepEntry>,
    sessions: BTreeMap<SessionId, SessionEntry>,
    chains: BTreeMap<ChainId, ChainEntry>,
    pub(crate) timers: TimerQueue,
    pending_start: VecDeque<StepId>,
    // u64 ids are never reused: exhausting them takes centuries at any
    // realistic allocation rate
    next_step: u64,
    next_session: u64,
    next_chain: u64,
    stats: WorkerStats,
}

impl Worker {
    /// Create a worker on the wall clock
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, Rc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Rc<dyn Clock>) -> Self {
        Self {
            config: config.worker.clone(),
            chain_defaults: config.chain.clone(),
            clock,
            registry: Registry::new(),
            steps: BTreeMap::new(),
            sessions: BTreeMap::new(),
            chains: BTreeMap::new(),
            timers: TimerQueue::new(),
            pending_start: VecDeque::new(),
            next_step: 1,
            next_session: 1,
            next_chain: 1,
            stats: WorkerStats::default(),
        }
    }

    /// Deadline `delay` from now, or `None` when the clock cannot represent it
    pub(crate) fn deadline_after(&self, delay: Duration) -> Option<Instant> {
        self.clock.now().checked_add(delay)
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn has_step(&self, id: StepId) -> bool {
        self.steps.contains_key(&id)
    }

    /// Trace a session was created under
    pub fn session_trace(&self, id: SessionId) -> Option<&TraceContext> {
        self.sessions.get(&id).map(|e| &e.trace)
    }

    /// Drop a session from the table; other holders keep their handle
    pub fn remove_session(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    /// No live steps, nothing waiting to start, no armed timers
    pub fn is_idle(&self) -> bool {
        self.steps.is_empty() && self.pending_start.is_empty() && self.timers.is_empty()
    }

    /// Nothing left that could call a step back: no pending starts, no timers
    pub fn is_quiescent(&self) -> bool {
        self.pending_start.is_empty() && self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ─── Chains ──────────────────────────────────────────────────────────────

    /// Create a chain with the configured timeout and policy
    pub fn create_chain(&mut self, trace: TraceContext, name: &str) -> ChainId {
        let timeout = self.chain_defaults.timeout();
        let policy = self.chain_defaults.policy;
        self.create_chain_with(trace, name, timeout, policy)
    }

    /// Create a chain and arm its deadline
    pub fn create_chain_with(
        &mut self,
        trace: TraceContext,
        name: &str,
        timeout: Duration,
        policy: TimeoutPolicy,
    ) -> ChainId {
        let id = ChainId(self.next_chain);
        self.next_chain += 1;

        let chain = Chain::new(trace, name)
            .with_timeout(timeout)
            .with_policy(policy);
        let timer = match self.deadline_after(timeout) {
            Some(deadline) => Some(self.timers.arm(deadline, TimerTarget::Chain(id))),
            None => {
                crate::trace_log!(
                    chain.trace(),
                    WARN,
                    "{} '{}' timeout {:?} is past the clock's range, it never expires",
                    id,
                    name,
                    timeout
                );
                None
            }
        };

        crate::trace_log!(
            chain.trace(),
            DEBUG,
            "created {} '{}' (timeout {:?}, policy {})",
            id,
            name,
            timeout,
            policy
        );

        self.chains.insert(
            id,
            ChainEntry {
                chain,
                timer,
                timed_out: false,
            },
        );
        self.stats.chains_created += 1;
        id
    }

    pub fn chain(&self, id: ChainId) -> Option<&Chain> {
        self.chains.get(&id).map(|e| &e.chain)
    }

    pub fn chain_mut(&mut self, id: ChainId) -> Option<&mut Chain> {
        self.chains.get_mut(&id).map(|e| &mut e.chain)
    }

    /// First chain of `trace` named `name`
    pub fn find_chain(&self, trace: &TraceContext, name: &str) -> Option<ChainId> {
        self.chains
            .iter()
            .find(|(_, e)| e.chain.trace() == trace && e.chain.name() == name)
            .map(|(id, _)| *id)
    }

    /// Whether the chain's timeout hook has run
    pub fn chain_timed_out(&self, id: ChainId) -> bool {
        self.chains.get(&id).is_some_and(|e| e.timed_out)
    }

    /// Destroy a chain and cancel its deadline.
    ///
    /// Steps still queued on it are not called back.
    pub fn destroy_chain(&mut self, id: ChainId) -> bool {
        let Some(entry) = self.chains.remove(&id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            self.timers.cancel(timer);
        }
        let abandoned = entry.chain.waiting_steps().len();
        if abandoned > 0 {
            crate::trace_log!(
                entry.chain.trace(),
                WARN,
                "destroyed {} '{}' with {} step(s) still waiting",
                id,
                entry.chain.name(),
                abandoned
            );
        }
        true
    }

    /// Factory surface for a chain
    pub fn scope(&mut self, chain: ChainId) -> Result<ChainScope<'_>, WorkerError> {
        ChainScope::new(self, chain).ok_or(WorkerError::ChainNotFound(chain))
    }

    // ─── Steps and sessions ──────────────────────────────────────────────────

    /// Register a step under `trace` and start it.
    ///
    /// Returns `None` when the step table is full.
    pub fn spawn_step<S: Step + 'static>(&mut self, trace: TraceContext, step: S) -> Option<StepId> {
        if self.steps.len() >= self.config.max_steps {
            crate::trace_log!(
                &trace,
                WARN,
                "step table full ({}), not spawning '{}'",
                self.config.max_steps,
                step.name()
            );
            return None;
        }
        let shared: SharedStep = Rc::new(std::cell::RefCell::new(step));
        let id = self.insert_step(trace, shared);
        self.settle();
        Some(id)
    }

    pub(crate) fn make_shared_step(
        &mut self,
        trace: &TraceContext,
        name: &str,
        args: &Value,
    ) -> Option<(StepId, SharedStep)> {
        if self.steps.len() >= self.config.max_steps {
            crate::trace_log!(
                trace,
                WARN,
                "step table full ({}), cannot create '{}'",
                self.config.max_steps,
                name
            );
            return None;
        }
        let Some(step) = self.registry.build_step(name, args) else {
            crate::trace_log!(trace, WARN, "failed to create step '{}'", name);
            return None;
        };
        let id = self.insert_step(trace.clone(), step.clone());
        Some((id, step))
    }

    pub(crate) fn make_shared_session(
        &mut self,
        trace: &TraceContext,
        name: &str,
        args: &Value,
    ) -> Option<(SessionId, SharedSession)> {
        if self.sessions.len() >= self.config.max_sessions {
            crate::trace_log!(
                trace,
                WARN,
                "session table full ({}), cannot create '{}'",
                self.config.max_sessions,
                name
            );
            return None;
        }
        let Some(session) = self.registry.build_session(name, args) else {
            crate::trace_log!(trace, WARN, "failed to create session '{}'", name);
            return None;
        };
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            id,
            SessionEntry {
                trace: trace.clone(),
                session: session.clone(),
            },
        );
        Some((id, session))
    }

    fn insert_step(&mut self, trace: TraceContext, step: SharedStep) -> StepId {
        let id = StepId(self.next_step);
        self.next_step += 1;
        self.steps.insert(id, StepEntry { trace, step });
        self.pending_start.push_back(id);
        id
    }

    /// Call a step back with `event`, then settle
    pub fn resume(&mut self, id: StepId, event: StepEvent) -> Result<CmdStatus, WorkerError> {
        let status = self.dispatch(id, event)?;
        self.settle();
        Ok(status)
    }

    /// Start pending steps and drain ready chains until nothing changes
    pub fn run_pending(&mut self) {
        self.settle();
    }

    fn dispatch(&mut self, id: StepId, event: StepEvent) -> Result<CmdStatus, WorkerError> {
        let (step, trace) = match self.steps.get(&id) {
            Some(entry) => (entry.step.clone(), entry.trace.clone()),
            None => return Err(WorkerError::StepNotFound(id)),
        };
        let mut guard = step.try_borrow_mut().map_err(|_| WorkerError::StepBusy(id))?;

        let status = {
            let mut ctx = StepContext::new(self, id, trace);
            guard.callback(&mut ctx, event)
        };
        debug!(step = %id, name = guard.name(), ?event, %status, "step callback returned");
        drop(guard);

        if status.is_finished() {
            self.steps.remove(&id);
            if status == CmdStatus::Done {
                self.stats.steps_done += 1;
            } else {
                self.stats.steps_failed += 1;
            }
        }
        Ok(status)
    }

    /// Dispatch to a step that may have gone away since it was queued
    fn wake(&mut self, id: StepId, event: StepEvent) {
        match self.dispatch(id, event) {
            Ok(_) => self.stats.wakes += 1,
            Err(WorkerError::StepNotFound(_)) => {
                debug!(step = %id, ?event, "skipping wake for finished step");
            }
            Err(e) => warn!(?event, "wake failed: {}", e),
        }
    }

    fn settle(&mut self) {
        loop {
            let mut progressed = false;

            while let Some(id) = self.pending_start.pop_front() {
                progressed = true;
                self.stats.steps_started += 1;
                self.wake(id, StepEvent::Start);
            }

            let ready: Vec<ChainId> = self
                .chains
                .iter()
                .filter(|(_, e)| e.chain.is_ready() && (e.timer.is_some() || e.chain.has_waiters()))
                .map(|(id, _)| *id)
                .collect();

            for id in ready {
                progressed = true;
                let Some(entry) = self.chains.get_mut(&id) else {
                    continue;
                };
                if let Some(timer) = entry.timer.take() {
                    self.timers.cancel(timer);
                }
                let waiters = entry.chain.take_waiting();
                for step in waiters {
                    self.wake(step, StepEvent::ChainReady(id));
                }
            }

            if !progressed {
                break;
            }
        }
    }

    // ─── Timers ──────────────────────────────────────────────────────────────

    /// Fire every timer that is due, in deadline order, settling after each.
    ///
    /// Returns how many timers fired.
    pub fn poll_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Some((_, target)) = self.timers.pop_expired(self.clock.now()) {
            fired += 1;
            match target {
                TimerTarget::Chain(id) => self.fire_chain_timeout(id),
                TimerTarget::Step(id) => self.wake(id, StepEvent::Timer),
            }
            self.settle();
        }
        fired
    }

    fn fire_chain_timeout(&mut self, id: ChainId) {
        let Some(entry) = self.chains.get_mut(&id) else {
            return;
        };
        entry.timer = None;
        if entry.chain.is_ready() || entry.timed_out {
            return;
        }
        entry.timed_out = true;
        self.stats.chains_timed_out += 1;

        let status = entry.chain.timeout();
        if status == CmdStatus::Running {
            return;
        }

        let waiters = entry.chain.take_waiting();
        for step in &waiters {
            self.wake(*step, StepEvent::ChainTimeout(id));
        }

        if matches!(status, CmdStatus::Error | CmdStatus::Timeout) {
            let unique: BTreeSet<StepId> = waiters.into_iter().collect();
            for step in unique {
                if self.steps.remove(&step).is_some() {
                    self.stats.steps_aborted += 1;
                    debug!(step = %step, chain = %id, "aborted step after chain failure");
                }
            }
        }

        self.destroy_chain(id);
    }

    /// Poll timers on a fixed tick until shutdown.
    ///
    /// With `worker.exit_when_idle` set the loop also ends once nothing is
    /// left to fire; steps still suspended at that point are logged.
    pub async fn run(&mut self, shutdown: Option<mpsc::Receiver<()>>) -> Result<()> {
        info!(
            "worker loop started, tick interval: {:?}",
            self.config.tick_interval()
        );

        let mut shutdown = shutdown;
        let mut interval = tokio::time::interval(self.config.tick_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_timers();
                    if self.config.exit_when_idle && self.is_quiescent() {
                        if !self.steps.is_empty() {
                            warn!(
                                "leaving loop with {} step(s) suspended and no timers armed",
                                self.steps.len()
                            );
                        }
                        info!("worker idle, leaving loop");
                        break;
                    }
                }
                _ = async {
                    if let Some(ref mut rx) = shutdown {
                        rx.recv().await
                    } else {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("worker loop shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<(&'static str, StepEvent)>>>;

    /// Waits on one chain; optionally loads it on first start
    struct Waiter {
        label: &'static str,
        chain: ChainId,
        log: Log,
        status_on_timeout: CmdStatus,
    }

    impl Step for Waiter {
        fn name(&self) -> &str {
            self.label
        }

        fn callback(&mut self, ctx: &mut StepContext<'_>, event: StepEvent) -> CmdStatus {
            self.log.borrow_mut().push((self.label, event));
            match event {
                StepEvent::ChainTimeout(_) => self.status_on_timeout,
                _ => {
                    let me = ctx.step_id();
                    match ctx.chain_mut(self.chain) {
                        Some(chain) => {
                            if chain.check_ready(me) {
                                CmdStatus::Done
                            } else {
                                CmdStatus::Running
                            }
                        }
                        None => CmdStatus::Error,
                    }
                }
            }
        }
    }

    fn make_worker() -> (Worker, ManualClock) {
        let clock = ManualClock::new();
        let worker = Worker::with_clock(&Config::default(), Rc::new(clock.clone()));
        (worker, clock)
    }

    fn spawn_waiter(
        worker: &mut Worker,
        trace: &TraceContext,
        label: &'static str,
        chain: ChainId,
        log: &Log,
    ) -> StepId {
        worker
            .spawn_step(
                trace.clone(),
                Waiter {
                    label,
                    chain,
                    log: log.clone(),
                    status_on_timeout: CmdStatus::Timeout,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_ready_drains_waiters_in_fifo_order() {
        let (mut worker, _clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain(trace.clone(), "data");
        let log = Log::default();

        let a = spawn_waiter(&mut worker, &trace, "a", chain, &log);
        let b = spawn_waiter(&mut worker, &trace, "b", chain, &log);
        let c = spawn_waiter(&mut worker, &trace, "c", chain, &log);
        let queued: Vec<_> = worker.chain(chain).unwrap().waiting_steps().collect();
        assert_eq!(queued, vec![a, b, c]);

        worker.chain_mut(chain).unwrap().set_ready();
        worker.run_pending();

        let wakes: Vec<_> = log
            .borrow()
            .iter()
            .filter(|(_, e)| *e == StepEvent::ChainReady(chain))
            .map(|(label, _)| *label)
            .collect();
        assert_eq!(wakes, vec!["a", "b", "c"]);
        assert_eq!(worker.step_count(), 0);
        assert!(!worker.chain(chain).unwrap().has_waiters());
        assert!(worker.is_idle());
    }

    #[test]
    fn test_timeout_fires_once_after_deadline() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace.clone(),
            "data",
            Duration::from_millis(50),
            TimeoutPolicy::Linger,
        );
        let log = Log::default();
        spawn_waiter(&mut worker, &trace, "a", chain, &log);

        clock.advance(Duration::from_millis(49));
        assert_eq!(worker.poll_timers(), 0);
        assert!(!worker.chain_timed_out(chain));

        clock.advance(Duration::from_millis(51));
        assert_eq!(worker.poll_timers(), 1);
        assert!(worker.chain_timed_out(chain));
        assert_eq!(worker.stats().chains_timed_out, 1);

        clock.advance(Duration::from_secs(120));
        assert_eq!(worker.poll_timers(), 0);
        assert_eq!(worker.stats().chains_timed_out, 1);
        assert!(!worker.chain(chain).unwrap().is_ready());
    }

    #[test]
    fn test_linger_wakes_late_ready() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace.clone(),
            "data",
            Duration::from_millis(10),
            TimeoutPolicy::Linger,
        );
        let log = Log::default();
        spawn_waiter(&mut worker, &trace, "a", chain, &log);

        clock.advance(Duration::from_millis(20));
        worker.poll_timers();
        assert_eq!(worker.step_count(), 1);

        worker.chain_mut(chain).unwrap().set_ready();
        worker.run_pending();
        assert_eq!(worker.step_count(), 0);
        assert_eq!(log.borrow().last(), Some(&("a", StepEvent::ChainReady(chain))));
    }

    #[test]
    fn test_fail_policy_aborts_running_waiters() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace.clone(),
            "data",
            Duration::from_millis(10),
            TimeoutPolicy::Fail,
        );
        let log = Log::default();
        let stubborn = worker
            .spawn_step(
                trace.clone(),
                Waiter {
                    label: "stubborn",
                    chain,
                    log: log.clone(),
                    status_on_timeout: CmdStatus::Running,
                },
            )
            .unwrap();
        spawn_waiter(&mut worker, &trace, "polite", chain, &log);

        clock.advance(Duration::from_millis(10));
        worker.poll_timers();

        assert!(!worker.has_step(stubborn));
        assert_eq!(worker.step_count(), 0);
        assert_eq!(worker.stats().steps_aborted, 1);
        assert_eq!(worker.stats().steps_failed, 1);
        assert!(worker.chain(chain).is_none());
    }

    #[test]
    fn test_degrade_policy_resumes_then_destroys() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace.clone(),
            "data",
            Duration::from_millis(10),
            TimeoutPolicy::Degrade,
        );
        let log = Log::default();
        worker
            .spawn_step(
                trace.clone(),
                Waiter {
                    label: "a",
                    chain,
                    log: log.clone(),
                    status_on_timeout: CmdStatus::Done,
                },
            )
            .unwrap();

        clock.advance(Duration::from_millis(10));
        worker.poll_timers();

        assert_eq!(log.borrow().last(), Some(&("a", StepEvent::ChainTimeout(chain))));
        assert_eq!(worker.stats().steps_done, 1);
        assert!(worker.chain(chain).is_none());
        assert!(worker.is_idle());
    }

    #[test]
    fn test_ready_cancels_deadline() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace,
            "data",
            Duration::from_millis(10),
            TimeoutPolicy::Fail,
        );
        worker.chain_mut(chain).unwrap().set_ready();
        worker.run_pending();
        assert!(worker.timers.is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(worker.poll_timers(), 0);
        assert!(!worker.chain_timed_out(chain));
    }

    /// Asks for a step timer on start and finishes when it fires
    struct Sleeper {
        delay: Duration,
        armed: Rc<RefCell<Option<bool>>>,
    }

    impl Step for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn callback(&mut self, ctx: &mut StepContext<'_>, event: StepEvent) -> CmdStatus {
            match event {
                StepEvent::Start => {
                    *self.armed.borrow_mut() = Some(ctx.schedule(self.delay));
                    CmdStatus::Running
                }
                _ => CmdStatus::Done,
            }
        }
    }

    #[test]
    fn test_out_of_range_chain_timeout_never_expires() {
        let (mut worker, clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain_with(
            trace.clone(),
            "data",
            Duration::MAX,
            TimeoutPolicy::Fail,
        );
        let log = Log::default();
        spawn_waiter(&mut worker, &trace, "a", chain, &log);

        assert!(worker.timers.is_empty());
        clock.advance(Duration::from_secs(3600));
        assert_eq!(worker.poll_timers(), 0);
        assert!(!worker.chain_timed_out(chain));

        worker.chain_mut(chain).unwrap().set_ready();
        worker.run_pending();
        assert_eq!(log.borrow().last(), Some(&("a", StepEvent::ChainReady(chain))));
    }

    #[test]
    fn test_out_of_range_step_timer_is_refused() {
        let (mut worker, _clock) = make_worker();
        let armed = Rc::new(RefCell::new(None));
        let far = worker
            .spawn_step(
                TraceContext::new(),
                Sleeper {
                    delay: Duration::MAX,
                    armed: armed.clone(),
                },
            )
            .unwrap();
        assert_eq!(*armed.borrow(), Some(false));
        assert!(worker.timers.is_empty());
        assert!(worker.has_step(far));

        let (mut worker, clock) = make_worker();
        let armed = Rc::new(RefCell::new(None));
        worker
            .spawn_step(
                TraceContext::new(),
                Sleeper {
                    delay: Duration::from_millis(5),
                    armed: armed.clone(),
                },
            )
            .unwrap();
        assert_eq!(*armed.borrow(), Some(true));
        clock.advance(Duration::from_millis(5));
        assert_eq!(worker.poll_timers(), 1);
        assert_eq!(worker.step_count(), 0);
    }

    #[test]
    fn test_ids_keep_increasing_past_u32_range() {
        let (mut worker, _clock) = make_worker();
        let start = u64::from(u32::MAX);
        worker.next_step = start;
        worker.next_chain = start;

        let trace = TraceContext::new();
        let c1 = worker.create_chain(trace.clone(), "a");
        let c2 = worker.create_chain(trace.clone(), "b");
        assert_eq!((c1, c2), (ChainId(start), ChainId(start + 1)));

        let log = Log::default();
        let s1 = spawn_waiter(&mut worker, &trace, "a", c1, &log);
        let s2 = spawn_waiter(&mut worker, &trace, "b", c1, &log);
        assert_eq!((s1, s2), (StepId(start), StepId(start + 1)));
        assert_eq!(worker.step_count(), 2);
    }

    #[test]
    fn test_wake_skips_finished_steps() {
        let (mut worker, _clock) = make_worker();
        let trace = TraceContext::from_id("t");
        let chain = worker.create_chain(trace.clone(), "data");
        let ghost = StepId(999);
        worker.chain_mut(chain).unwrap().check_ready(ghost);

        worker.chain_mut(chain).unwrap().set_ready();
        worker.run_pending();
        assert_eq!(worker.stats().wakes, 0);
        assert!(!worker.chain(chain).unwrap().has_waiters());
    }

    #[test]
    fn test_resume_unknown_step() {
        let (mut worker, _clock) = make_worker();
        assert_eq!(
            worker.resume(StepId(5), StepEvent::Timer),
            Err(WorkerError::StepNotFound(StepId(5)))
        );
        assert!(worker.scope(ChainId(1)).is_err());
    }

    #[test]
    fn test_destroy_chain_cancels_timer() {
        let (mut worker, clock) = make_worker();
        let chain = worker.create_chain(TraceContext::new(), "data");
        assert!(worker.destroy_chain(chain));
        assert!(!worker.destroy_chain(chain));

        clock.advance(Duration::from_secs(61));
        assert_eq!(worker.poll_timers(), 0);
        assert_eq!(worker.stats().chains_timed_out, 0);
    }

    #[test]
    fn test_find_chain_is_per_trace() {
        let (mut worker, _clock) = make_worker();
        let t1 = TraceContext::from_id("t1");
        let t2 = TraceContext::from_id("t2");
        let c1 = worker.create_chain(t1.clone(), "user");
        let c2 = worker.create_chain(t2.clone(), "user");

        assert_eq!(worker.find_chain(&t1, "user"), Some(c1));
        assert_eq!(worker.find_chain(&t2, "user"), Some(c2));
        assert_eq!(worker.find_chain(&t1, "orders"), None);
    }

    #[test]
    fn test_spawn_respects_capacity() {
        let clock = ManualClock::new();
        let mut config = Config::default();
        config.worker.max_steps = 1;
        let mut worker = Worker::with_clock(&config, Rc::new(clock));
        let trace = TraceContext::new();
        let chain = worker.create_chain(trace.clone(), "data");
        let log = Log::default();

        spawn_waiter(&mut worker, &trace, "a", chain, &log);
        let second = worker.spawn_step(
            trace,
            Waiter {
                label: "b",
                chain,
                log,
                status_on_timeout: CmdStatus::Timeout,
            },
        );
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_run_exits_when_idle() {
        let mut config = Config::default();
        config.worker.tick_interval_ms = 1;
        config.worker.exit_when_idle = true;
        let mut worker = Worker::new(&config);
        let chain = worker.create_chain_with(
            TraceContext::new(),
            "data",
            Duration::from_millis(20),
            TimeoutPolicy::Degrade,
        );

        tokio::time::timeout(Duration::from_secs(5), worker.run(None))
            .await
            .expect("worker loop should finish")
            .unwrap();
        assert!(worker.chain(chain).is_none());
        assert_eq!(worker.stats().chains_timed_out, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut worker = Worker::new(&Config::default());
        worker.create_chain(TraceContext::new(), "data");
        let (tx, rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker.run(Some(rx)))
            .await
            .expect("worker loop should stop")
            .unwrap();
        assert_eq!(worker.chain_count(), 1);
    }
}
