mod catalogue;
mod checkpoint;
mod config;
mod distributed;
mod evaluator;
mod executors;
mod ledger;
mod metrics;
mod monitor;
mod outcome;
mod partition;
mod pipeline;
mod recovery;
mod results;
mod worker;

#[cfg(test)]
mod catalogue_test;
#[cfg(test)]
mod ledger_test;
#[cfg(test)]
mod recovery_test;

use crate::{
    catalogue::{Catalogue, JobId},
    checkpoint::WorkerId,
    config::{ConfigErrors, RunnerConfig},
    distributed::fs::PidFile,
    evaluator::exec::ExecEvaluator,
    monitor::Monitor,
    pipeline::RunnerError,
    worker::{run_worker, WorkerOptions},
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::{
    io,
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Partitioned, resumable runner for indicator backtest jobs
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// runner config file
    #[arg(short, long, default_value = "runner.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one cycle over all pending jobs
    Run {
        /// block jobs in addition to the ones already blocked
        #[arg(long, value_delimiter = ',')]
        block: Vec<JobId>,
    },
    /// Work through a single chunk, started by the process executor
    Worker {
        #[arg(long)]
        id: WorkerId,
        #[arg(long, value_delimiter = ',', required = true)]
        jobs: Vec<JobId>,
        /// start of the run this worker belongs to, names the outcome document
        #[arg(long)]
        run_stamp: Option<DateTime<Utc>>,
    },
    /// Watch the progress of the workers
    Monitor {
        /// render a single tick and exit
        #[arg(long)]
        once: bool,
        /// stop after this many ticks
        #[arg(long, conflicts_with = "once")]
        ticks: Option<u64>,
    },
    /// Recompute and save the ledger
    Ledger {
        #[arg(long, value_delimiter = ',')]
        block: Vec<JobId>,
    },
    /// Show how the pending jobs would be split across the workers
    Partition,
    /// Block the first job of every chunk of the last run and stop all registered processes
    Recover {
        /// only show what would be blocked
        #[arg(long)]
        dry_run: bool,
    },
}

fn load_config(path: &Path, preflight: bool) -> Result<RunnerConfig, RunnerError> {
    let mut config = RunnerConfig::load(path)?;

    if preflight && config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    Ok(config)
}

fn run(cli: Cli) -> Result<(), RunnerError> {
    match cli.command {
        Command::Run { block } => {
            let config = load_config(&cli.config, true)?;
            let report = pipeline::run_cycle(&config, &cli.config, &block.into_iter().collect())?;

            println!("{report}");
        }
        Command::Worker {
            id,
            jobs,
            run_stamp,
        } => {
            let config = load_config(&cli.config, false)?;
            let catalogue = Catalogue::load(&config.catalogue)?;
            let _registration = PidFile::register(&config.paths.pids, &format!("worker_{id}"))?;

            let evaluator = ExecEvaluator::load(&config.evaluator);
            let options = WorkerOptions::from_config(&config);
            let records = run_worker(
                id,
                &evaluator,
                &options,
                &catalogue,
                &jobs,
                run_stamp.unwrap_or_else(Utc::now),
            );

            info!(worker = id, jobs = records.len(), "Worker finished");
        }
        Command::Monitor { once, ticks } => {
            let config = load_config(&cli.config, false)?;
            let _registration = PidFile::register(&config.paths.pids, "monitor")?;

            let ticks = if once { Some(1) } else { ticks };
            Monitor::load(&config).run(ticks, &mut io::stdout().lock())?;
        }
        Command::Ledger { block } => {
            let config = load_config(&cli.config, false)?;
            let catalogue = Catalogue::load(&config.catalogue)?;
            let ledger = pipeline::update_ledger(&config, &catalogue, &block.into_iter().collect())?;

            println!("{}", ledger.summary());
        }
        Command::Partition => {
            let config = load_config(&cli.config, false)?;
            let catalogue = Catalogue::load(&config.catalogue)?;
            let (ledger, chunks) = pipeline::plan_chunks(&config, &catalogue)?;

            println!("{}", ledger.summary());
            for (worker, chunk) in chunks.iter().enumerate() {
                println!(
                    "worker {worker}: {} jobs [{}]",
                    chunk.len(),
                    chunk.iter().join(", ")
                );
            }
        }
        Command::Recover { dry_run } => {
            let config = load_config(&cli.config, false)?;
            let recovery = pipeline::recover(&config, dry_run)?;
            let candidates = recovery.plan.candidates.iter().join(", ");

            if dry_run {
                println!("would block [{candidates}]");
            } else {
                println!("blocked [{candidates}]");
            }
            println!("{}", recovery.ledger.summary());

            if let Some(termination) = recovery.termination {
                println!(
                    "signalled {:?} | stale pid files removed {} | failed {:?}",
                    termination.signalled,
                    termination.stale.len(),
                    termination.failed
                );
            }
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli) {
        error!("{error}");
        exit(1);
    }
}
