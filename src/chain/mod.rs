//! Per-trace shared data cache with single-flight loading.
//!
//! A [`Chain`] lets several steps of one request share data that is loaded
//! from an external store at most once. Steps follow one protocol:
//!
//! 1. Call [`Chain::check_ready`]. `true` means the payload can be read now.
//! 2. On `false` the step is queued as a waiter. If [`Chain::is_loading`] is
//!    set, someone else is fetching: return [`CmdStatus::Running`].
//! 3. Otherwise call [`Chain::set_loading`], launch the fetch and return
//!    `Running`. When the fetch completes, [`Chain::store`] the payload and
//!    call [`Chain::set_ready`].
//!
//! The worker then resumes every queued step in the order they were queued.
//! If the chain is still not ready when its timeout elapses, the worker calls
//! [`Chain::timeout`] once and acts on the returned status.
//!
//! The loading flag is never cleared. A caller that sets it must eventually
//! call `set_ready` or let the chain time out; a failed fetch is only
//! recovered through the timeout path.

pub mod policy;

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::step::{CmdStatus, StepId};
use crate::trace::TraceContext;

pub use policy::TimeoutPolicy;

/// Default seconds before an unready chain is expired
pub const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Handle to a chain in the worker's chain table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(pub(crate) u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Readiness of the cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Empty,
    Loading,
    Ready,
}

pub struct Chain {
    name: String,
    trace: TraceContext,
    timeout: Duration,
    policy: TimeoutPolicy,
    ready: bool,
    loading: bool,
    waiting: VecDeque<StepId>,
    payload: Option<Box<dyn Any>>,
}

impl Chain {
    /// Create an empty chain with the default timeout and policy
    pub fn new(trace: TraceContext, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trace,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            policy: TimeoutPolicy::default(),
            ready: false,
            loading: false,
            waiting: VecDeque::new(),
            payload: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// How long the worker waits for readiness before calling [`Chain::timeout`]
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn state(&self) -> ChainState {
        if self.ready {
            ChainState::Ready
        } else if self.loading {
            ChainState::Loading
        } else {
            ChainState::Empty
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mark the data as loaded. Idempotent; readiness is never revoked.
    ///
    /// The worker resumes every queued step once the current callback returns.
    pub fn set_ready(&mut self) {
        if !self.ready {
            crate::trace_log!(
                &self.trace,
                DEBUG,
                "chain '{}' ready, {} step(s) to resume",
                self.name,
                self.waiting.len()
            );
        }
        self.ready = true;
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Claim the fetch. Call before issuing it so later steps in the same
    /// tick see a load in flight.
    ///
    /// There is no way back: a loader that gives up leaves the flag set until
    /// the chain is made ready or times out.
    pub fn set_loading(&mut self) {
        self.loading = true;
    }

    /// Readiness check that registers the caller as a waiter.
    ///
    /// Returns `true` without side effects when the data is ready. Otherwise
    /// `step` is appended to the waiting queue (repeat calls append again)
    /// and `false` is returned: the caller is now registered to be woken.
    pub fn check_ready(&mut self, step: StepId) -> bool {
        if self.ready {
            return true;
        }
        self.waiting.push_back(step);
        false
    }

    /// Steps queued for wake-up, oldest first
    pub fn waiting_steps(&self) -> impl ExactSizeIterator<Item = StepId> + '_ {
        self.waiting.iter().copied()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Empty the waiting queue, preserving order
    pub(crate) fn take_waiting(&mut self) -> VecDeque<StepId> {
        std::mem::take(&mut self.waiting)
    }

    /// Cache the loaded value, replacing any previous one
    pub fn store<T: Any>(&mut self, value: T) {
        self.payload = Some(Box::new(value));
    }

    /// Cached value, if one of type `T` was stored
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    /// Deadline hook, called by the worker at most once and only while unready
    pub fn timeout(&mut self) -> CmdStatus {
        let waiting = self.waiting.len();
        match self.policy {
            TimeoutPolicy::Fail => {
                self.payload = None;
                crate::trace_log!(
                    &self.trace,
                    WARN,
                    "chain '{}' not ready after {:?} (loading: {}), failing {} waiting step(s)",
                    self.name,
                    self.timeout,
                    self.loading,
                    waiting
                );
            }
            TimeoutPolicy::Degrade => {
                crate::trace_log!(
                    &self.trace,
                    INFO,
                    "chain '{}' not ready after {:?}, resuming {} step(s) without data",
                    self.name,
                    self.timeout,
                    waiting
                );
            }
            TimeoutPolicy::Linger => {
                crate::trace_log!(
                    &self.trace,
                    WARN,
                    "chain '{}' not ready after {:?}, keeping {} step(s) queued",
                    self.name,
                    self.timeout,
                    waiting
                );
            }
        }
        self.policy.status()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("trace", &self.trace)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .field("waiting", &self.waiting)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
