//! Step surface: the resumable unit of work driven by a [`Worker`](crate::worker::Worker)

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chain::ChainId;
use crate::worker::StepContext;

/// Handle to a step in the worker's step table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(pub(crate) u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step#{}", self.0)
    }
}

/// Continuation signal a step hands back to the worker.
///
/// Also the status a chain's timeout hook reports about its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdStatus {
    /// Suspended; the worker calls back on the next event for this step
    Running,
    /// Finished successfully
    Done,
    /// Finished with a failure
    Error,
    /// Gave up waiting
    Timeout,
}

impl CmdStatus {
    /// Whether the step is finished and can be dropped from the worker table
    pub fn is_finished(&self) -> bool {
        !matches!(self, CmdStatus::Running)
    }
}

impl fmt::Display for CmdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdStatus::Running => write!(f, "running"),
            CmdStatus::Done => write!(f, "done"),
            CmdStatus::Error => write!(f, "error"),
            CmdStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why the worker is calling a step back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// First dispatch after the step was registered
    Start,
    /// A chain this step waited on became ready
    ChainReady(ChainId),
    /// A chain this step waited on hit its deadline
    ChainTimeout(ChainId),
    /// A timer armed with [`StepContext::schedule`] expired
    Timer,
}

/// A resumable unit of per-request processing.
///
/// Steps never block. A step that has to wait returns [`CmdStatus::Running`]
/// and keeps whatever progress it needs in its own fields; the worker calls
/// [`Step::callback`] again when the awaited condition is met.
pub trait Step {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle one event and report how to continue
    fn callback(&mut self, ctx: &mut StepContext<'_>, event: StepEvent) -> CmdStatus;
}

/// Step shared between its creator and the worker table
pub type SharedStep = Rc<RefCell<dyn Step>>;
