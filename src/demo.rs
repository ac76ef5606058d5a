//! Demo trace for the `simulate` command.
//!
//! One [`FanOutStep`] creates a shared chain and builds N [`LoadRowsStep`]s
//! through the chain's factory scope. Every load step runs the same
//! single-flight protocol; only the first one to find the chain empty issues
//! the (simulated) fetch, the rest wait and are resumed when it lands.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::chain::{ChainId, TimeoutPolicy};
use crate::config::Config;
use crate::session::Session;
use crate::step::{CmdStatus, Step, StepEvent};
use crate::trace::TraceContext;
use crate::worker::{StepContext, Worker, WorkerStats};

/// Name of the chain shared by the demo steps
pub const CHAIN_NAME: &str = "rows";

/// Registry names
pub const LOAD_STEP: &str = "load_rows";
pub const FETCH_SESSION: &str = "fetch";

/// Cached payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rows(pub Vec<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Read the cached rows; `fetched` is set on the step that loaded them
    Loaded { rows: usize, fetched: bool },
    /// Chain expired and the step carried on without data
    Fallback,
    /// Chain expired or vanished and the step failed
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub label: String,
    pub outcome: Outcome,
}

pub type Reports = Rc<RefCell<Vec<StepReport>>>;

/// Correlates one simulated fetch
pub struct FetchSession {
    target: String,
}

impl Session for FetchSession {
    fn name(&self) -> &str {
        &self.target
    }
}

/// Reads the shared rows, loading them first if nobody else is
pub struct LoadRowsStep {
    label: String,
    rows: usize,
    load_delay: Option<Duration>,
    chain: Option<ChainId>,
    fetched: bool,
    reports: Reports,
}

impl LoadRowsStep {
    pub fn new(
        label: impl Into<String>,
        rows: usize,
        load_delay: Option<Duration>,
        reports: Reports,
    ) -> Self {
        Self {
            label: label.into(),
            rows,
            load_delay,
            chain: None,
            fetched: false,
            reports,
        }
    }

    /// Build from factory arguments: `{"label", "rows", "load_ms"}`.
    /// A missing or null `load_ms` means the fetch never completes.
    pub fn from_args(args: &Value, reports: Reports) -> Option<Self> {
        let label = args.get("label")?.as_str()?;
        let rows = args.get("rows").and_then(Value::as_u64).unwrap_or(0) as usize;
        let load_delay = args
            .get("load_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        Some(Self::new(label, rows, load_delay, reports))
    }

    fn report(&self, outcome: Outcome) {
        self.reports.borrow_mut().push(StepReport {
            label: self.label.clone(),
            outcome,
        });
    }

    fn read_or_load(&mut self, ctx: &mut StepContext<'_>) -> CmdStatus {
        let me = ctx.step_id();
        let id = match self.chain {
            Some(id) => id,
            None => {
                let id = ctx.obtain_chain(CHAIN_NAME);
                self.chain = Some(id);
                id
            }
        };

        let Some(chain) = ctx.chain_mut(id) else {
            self.report(Outcome::Failed);
            return CmdStatus::Error;
        };

        if chain.check_ready(me) {
            let rows = chain.payload::<Rows>().map(|r| r.0.len()).unwrap_or(0);
            self.report(Outcome::Loaded {
                rows,
                fetched: self.fetched,
            });
            return CmdStatus::Done;
        }

        if chain.is_loading() {
            return CmdStatus::Running;
        }
        chain.set_loading();
        self.fetched = true;

        crate::trace_log!(ctx.trace(), INFO, "{} fetching '{}'", self.label, CHAIN_NAME);
        if let Some(mut scope) = ctx.scope(id) {
            let args = json!({ "target": CHAIN_NAME });
            if scope.make_shared_session(FETCH_SESSION, &args).is_none() {
                crate::trace_log!(scope.trace(), DEBUG, "no fetch session for {}", self.label);
            }
        }
        if let Some(delay) = self.load_delay {
            ctx.schedule(delay);
        }
        CmdStatus::Running
    }

    fn finish_fetch(&mut self, ctx: &mut StepContext<'_>) -> CmdStatus {
        let rows = Rows((0..self.rows).map(|i| format!("row-{i}")).collect());
        let chain = match self.chain {
            Some(id) => ctx.chain_mut(id),
            None => None,
        };
        match chain {
            Some(chain) => {
                chain.store(rows);
                chain.set_ready();
                // Queued on the chain; resumed with ChainReady like every waiter
                CmdStatus::Running
            }
            None => {
                self.report(Outcome::Failed);
                CmdStatus::Error
            }
        }
    }
}

impl Step for LoadRowsStep {
    fn name(&self) -> &str {
        &self.label
    }

    fn callback(&mut self, ctx: &mut StepContext<'_>, event: StepEvent) -> CmdStatus {
        match event {
            StepEvent::Start | StepEvent::ChainReady(_) => self.read_or_load(ctx),
            StepEvent::Timer => self.finish_fetch(ctx),
            StepEvent::ChainTimeout(id) => {
                let policy = ctx.chain(id).map(|c| c.policy());
                if policy == Some(TimeoutPolicy::Degrade) {
                    self.report(Outcome::Fallback);
                    CmdStatus::Done
                } else {
                    self.report(Outcome::Failed);
                    CmdStatus::Timeout
                }
            }
        }
    }
}

/// Entry step: creates the chain and fans out the load steps
pub struct FanOutStep {
    steps: usize,
    rows: usize,
    load_delay: Option<Duration>,
    created: Rc<RefCell<usize>>,
}

impl Step for FanOutStep {
    fn name(&self) -> &str {
        "fan_out"
    }

    fn callback(&mut self, ctx: &mut StepContext<'_>, _event: StepEvent) -> CmdStatus {
        // A chain nobody reads would only sit there until its deadline
        if self.steps == 0 {
            return CmdStatus::Done;
        }
        let chain = ctx.obtain_chain(CHAIN_NAME);
        let load_ms = self.load_delay.map(|d| d.as_millis() as u64);
        let Some(mut scope) = ctx.scope(chain) else {
            return CmdStatus::Error;
        };

        for i in 0..self.steps {
            let args = json!({
                "label": format!("step-{}", i + 1),
                "rows": self.rows,
                "load_ms": load_ms,
            });
            match scope.make_shared_step(LOAD_STEP, &args) {
                Some(_) => *self.created.borrow_mut() += 1,
                None => crate::trace_log!(scope.trace(), WARN, "could not create step-{}", i + 1),
            }
        }
        CmdStatus::Done
    }
}

/// Inputs of one simulated trace
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of steps sharing the chain
    pub steps: usize,
    /// Rows the fetch produces
    pub rows: usize,
    /// Fetch latency; `None` never completes
    pub load_delay: Option<Duration>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            steps: 3,
            rows: 5,
            load_delay: Some(Duration::from_millis(50)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub trace: TraceContext,
    pub created: usize,
    pub steps: Vec<StepReport>,
    pub stats: WorkerStats,
    pub sessions: usize,
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Steps that issued the fetch
    pub fn fetches(&self) -> usize {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Loaded { fetched: true, .. }))
            .count()
    }
}

/// Worker with the demo step and session types registered
pub fn build_worker(config: &Config, reports: &Reports) -> Worker {
    let mut worker = Worker::new(config);
    let registry = worker.registry_mut();
    let step_reports = reports.clone();
    registry.register_step(LOAD_STEP, move |args: &Value| {
        LoadRowsStep::from_args(args, step_reports.clone())
    });
    registry.register_session(FETCH_SESSION, |args: &Value| {
        let target = args.get("target")?.as_str()?.to_string();
        Some(FetchSession { target })
    });
    worker
}

/// Run one trace to completion on the wall clock
pub async fn simulate(config: &Config, options: &SimulationOptions) -> Result<SimulationReport> {
    let mut config = config.clone();
    config.worker.exit_when_idle = true;

    let reports = Reports::default();
    let created = Rc::new(RefCell::new(0));
    let mut worker = build_worker(&config, &reports);
    let trace = TraceContext::new();
    let started = Instant::now();

    worker
        .spawn_step(
            trace.clone(),
            FanOutStep {
                steps: options.steps,
                rows: options.rows,
                load_delay: options.load_delay,
                created: created.clone(),
            },
        )
        .context("step table is full")?;
    worker.run(None).await?;

    let steps = reports.borrow().clone();
    let created = *created.borrow();
    Ok(SimulationReport {
        trace,
        created,
        steps,
        stats: worker.stats().clone(),
        sessions: worker.session_count(),
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(timeout_secs: f64, policy: TimeoutPolicy) -> Config {
        let mut config = Config::default();
        config.chain.timeout_secs = timeout_secs;
        config.chain.policy = policy;
        config.worker.tick_interval_ms = 1;
        config
    }

    #[test]
    fn test_from_args() {
        let reports = Reports::default();
        let step = LoadRowsStep::from_args(
            &json!({ "label": "s1", "rows": 4, "load_ms": 15 }),
            reports.clone(),
        )
        .unwrap();
        assert_eq!(step.name(), "s1");
        assert_eq!(step.rows, 4);
        assert_eq!(step.load_delay, Some(Duration::from_millis(15)));

        let never =
            LoadRowsStep::from_args(&json!({ "label": "s2", "load_ms": null }), reports.clone())
                .unwrap();
        assert_eq!(never.load_delay, None);

        assert!(LoadRowsStep::from_args(&json!({ "rows": 1 }), reports).is_none());
    }

    #[tokio::test]
    async fn test_single_fetch_shared_by_all_steps() {
        let config = fast_config(5.0, TimeoutPolicy::Fail);
        let options = SimulationOptions {
            steps: 4,
            rows: 3,
            load_delay: Some(Duration::from_millis(10)),
        };

        let report = simulate(&config, &options).await.unwrap();

        assert_eq!(report.created, 4);
        assert_eq!(report.fetches(), 1);
        let labels: Vec<_> = report.steps.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["step-1", "step-2", "step-3", "step-4"]);
        assert!(report
            .steps
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Loaded { rows: 3, .. })));
        assert_eq!(report.stats.chains_timed_out, 0);
        assert_eq!(report.sessions, 1);
    }

    #[tokio::test]
    async fn test_no_steps_finishes_without_a_chain() {
        let config = fast_config(60.0, TimeoutPolicy::Fail);
        let options = SimulationOptions {
            steps: 0,
            ..SimulationOptions::default()
        };

        let report = tokio::time::timeout(Duration::from_secs(5), simulate(&config, &options))
            .await
            .expect("simulation should not wait for a chain deadline")
            .unwrap();

        assert_eq!(report.created, 0);
        assert!(report.steps.is_empty());
        assert_eq!(report.stats.chains_created, 0);
        assert_eq!(report.stats.chains_timed_out, 0);
    }

    #[tokio::test]
    async fn test_degrade_when_fetch_never_lands() {
        let config = fast_config(0.02, TimeoutPolicy::Degrade);
        let options = SimulationOptions {
            steps: 2,
            rows: 1,
            load_delay: None,
        };

        let report = simulate(&config, &options).await.unwrap();

        assert_eq!(report.stats.chains_timed_out, 1);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|r| r.outcome == Outcome::Fallback));
        assert!(report.elapsed >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_fail_when_fetch_never_lands() {
        let config = fast_config(0.02, TimeoutPolicy::Fail);
        let options = SimulationOptions {
            steps: 2,
            rows: 1,
            load_delay: None,
        };

        let report = simulate(&config, &options).await.unwrap();

        assert!(report.steps.iter().all(|r| r.outcome == Outcome::Failed));
        assert_eq!(report.stats.steps_failed, 2);
        assert_eq!(report.fetches(), 0);
    }

    #[tokio::test]
    async fn test_linger_then_late_fetch() {
        let config = fast_config(0.01, TimeoutPolicy::Linger);
        let options = SimulationOptions {
            steps: 2,
            rows: 2,
            load_delay: Some(Duration::from_millis(40)),
        };

        let report = simulate(&config, &options).await.unwrap();

        assert_eq!(report.stats.chains_timed_out, 1);
        assert_eq!(report.fetches(), 1);
        assert!(report
            .steps
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Loaded { rows: 2, .. })));
    }
}
