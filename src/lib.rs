//! nebula-chain - per-trace shared data coordination for cooperative step workers
//!
//! A [`Chain`] caches data for one request trace so that every [`Step`] of the
//! request loads it at most once. The [`Worker`] owns steps, sessions and
//! chains, resumes waiting steps when a chain becomes ready and runs a chain's
//! timeout hook when it never does.

pub mod chain;
pub mod config;
pub mod demo;
pub mod logging;
pub mod session;
pub mod step;
pub mod trace;
pub mod worker;

pub use chain::{Chain, ChainId, ChainState, TimeoutPolicy};
pub use config::Config;
pub use session::{Session, SessionId, SharedSession};
pub use step::{CmdStatus, SharedStep, Step, StepEvent, StepId};
pub use trace::TraceContext;
pub use worker::{ChainScope, StepContext, Worker, WorkerError};
