use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use nebula_chain::config::Config;
use nebula_chain::demo::{self, Outcome, SimulationOptions};
use nebula_chain::logging;
use nebula_chain::TimeoutPolicy;

#[derive(Parser)]
#[command(name = "nebula-chain")]
#[command(about = "Per-trace shared data coordination for cooperative step workers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one demo trace: N steps sharing a chain loaded once
    Simulate {
        /// Steps sharing the chain
        #[arg(short, long, default_value_t = 3)]
        steps: usize,

        /// Rows the simulated fetch returns
        #[arg(long, default_value_t = 5)]
        rows: usize,

        /// Simulated fetch latency in milliseconds
        #[arg(long, default_value_t = 50)]
        load_ms: u64,

        /// Fetch never completes (exercise the timeout path)
        #[arg(long)]
        never_load: bool,

        /// Chain timeout in seconds (overrides chain.timeout_secs)
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Timeout policy: fail, degrade or linger (overrides chain.policy)
        #[arg(short, long)]
        policy: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    let _logging_handle = logging::init_logging(&config, cli.debug)?;

    match cli.command {
        Commands::Simulate {
            steps,
            rows,
            load_ms,
            never_load,
            timeout,
            policy,
        } => {
            if let Some(secs) = timeout {
                config.chain.timeout_secs = secs;
            }
            if let Some(policy) = policy {
                config.chain.policy = policy.parse::<TimeoutPolicy>().map_err(|e| anyhow!(e))?;
            }
            config.validate()?;

            let options = SimulationOptions {
                steps,
                rows,
                load_delay: (!never_load).then(|| Duration::from_millis(load_ms)),
            };
            cmd_simulate(&config, &options).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn cmd_simulate(config: &Config, options: &SimulationOptions) -> Result<()> {
    let report = demo::simulate(config, options).await?;

    println!("Trace {}", report.trace);
    println!(
        "  chain timeout {:?}, policy {}",
        config.chain.timeout(),
        config.chain.policy
    );
    println!();

    for step in &report.steps {
        let outcome = match &step.outcome {
            Outcome::Loaded {
                rows,
                fetched: true,
            } => format!("loaded {} rows (fetched)", rows),
            Outcome::Loaded { rows, .. } => format!("loaded {} rows (cached)", rows),
            Outcome::Fallback => "fell back without data".to_string(),
            Outcome::Failed => "failed".to_string(),
        };
        println!("  {:<10} {}", step.label, outcome);
    }

    let unfinished = report.created.saturating_sub(report.steps.len());
    if unfinished > 0 {
        println!("  {} step(s) still suspended", unfinished);
    }

    println!();
    println!(
        "{} step(s), {} fetch(es), {} wake(s), {} chain timeout(s), {:?} elapsed",
        report.created,
        report.fetches(),
        report.stats.wakes,
        report.stats.chains_timed_out,
        report.elapsed
    );

    Ok(())
}
