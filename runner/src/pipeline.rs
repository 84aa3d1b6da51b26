use crate::{
    catalogue::{Catalogue, CatalogueError, JobId},
    checkpoint::{CheckpointError, CheckpointStore},
    config::{ConfigErrors, RunnerConfig},
    distributed::fs::{FsError, PidFile},
    executors::{ExecutionReport, Executor, ExecutorError, Executors},
    ledger::{Ledger, LedgerError},
    outcome::{OutcomeError, OutcomeHistory},
    partition::{chunk_heads, partition, Chunk, PartitionError},
    recovery::{plan_recovery, terminate_registered, RecoveryPlan, Termination},
    results::ResultStore,
};
use chrono::Utc;
use std::{collections::BTreeSet, path::Path};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("Invalid file pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("No saved ledger at {0:?}, there is no run to recover")]
    NoLedger(std::path::PathBuf),
}

/// Recompute the ledger from the artifacts, the outcome documents and all blocks so far.
/// Nothing is written.
pub fn recompute_ledger(
    config: &RunnerConfig,
    catalogue: &Catalogue,
    manual_blocks: &BTreeSet<JobId>,
) -> Result<Ledger, RunnerError> {
    let previous = Ledger::load(&config.paths.ledger)?;
    let blocks = match &previous {
        Some(previous) => &previous.block_list | manual_blocks,
        None => manual_blocks.clone(),
    };

    let artifacts = ResultStore::new(&config.paths.results).scan()?;
    let outcomes = OutcomeHistory::load_dir(&config.paths.outcomes)?;
    info!(
        artifacts = artifacts.len(),
        outcomes = outcomes.len(),
        blocks = blocks.len(),
        "Recomputing ledger"
    );

    Ok(Ledger::recompute(
        &catalogue.ids(),
        &artifacts,
        &outcomes,
        &blocks,
    )?)
}

/// Recompute and persist the ledger
pub fn update_ledger(
    config: &RunnerConfig,
    catalogue: &Catalogue,
    manual_blocks: &BTreeSet<JobId>,
) -> Result<Ledger, RunnerError> {
    let ledger = recompute_ledger(config, catalogue, manual_blocks)?;
    ledger.save(&config.paths.ledger)?;

    Ok(ledger)
}

/// Chunks the pending jobs would be split into right now
pub fn plan_chunks(
    config: &RunnerConfig,
    catalogue: &Catalogue,
) -> Result<(Ledger, Vec<Chunk>), RunnerError> {
    let ledger = recompute_ledger(config, catalogue, &BTreeSet::new())?;
    let chunks = partition(&ledger.to_run, config.executor.workers)?;

    Ok((ledger, chunks))
}

/// One full cycle: ledger, partition, execute, ledger again
#[instrument(level = "info", skip_all)]
pub fn run_cycle(
    config: &RunnerConfig,
    config_path: &Path,
    manual_blocks: &BTreeSet<JobId>,
) -> Result<ExecutionReport, RunnerError> {
    let catalogue = Catalogue::load(&config.catalogue)?;
    let ledger = update_ledger(config, &catalogue, manual_blocks)?;
    info!(summary = %ledger.summary(), "Starting cycle");

    let chunks = partition(&ledger.to_run, config.executor.workers)?;
    if chunks.is_empty() {
        info!("Nothing left to run");

        return Ok(ExecutionReport::default());
    }

    info!(
        chunks = chunks.len(),
        heads = ?chunk_heads(&chunks),
        "Partitioned pending jobs"
    );

    let removed = CheckpointStore::new(&config.paths.checkpoints).clear()?;
    if removed > 0 {
        info!("Removed {removed} checkpoints of a previous run");
    }

    let _registration = PidFile::register(&config.paths.pids, "run")?;
    let executor = Executors::load(config, config_path)?;
    let report = executor.execute(&catalogue, &chunks, Utc::now())?;

    let ledger = update_ledger(config, &catalogue, manual_blocks)?;
    info!(report = %report, summary = %ledger.summary(), "Finished cycle");

    Ok(report)
}

/// Outcome of a recovery, `None` termination for a dry run
#[derive(Debug)]
pub struct Recovery {
    pub plan: RecoveryPlan,
    pub ledger: Ledger,
    pub termination: Option<Termination>,
}

/// Block the chunk heads of the last run and stop all registered processes
#[instrument(level = "info", skip(config))]
pub fn recover(config: &RunnerConfig, dry_run: bool) -> Result<Recovery, RunnerError> {
    let saved = Ledger::load(&config.paths.ledger)?
        .ok_or_else(|| RunnerError::NoLedger(config.paths.ledger.clone()))?;
    let plan = plan_recovery(&saved, config.executor.workers)?;
    info!(candidates = ?plan.candidates, "Chunk heads of the last run");

    if dry_run {
        return Ok(Recovery {
            ledger: plan.apply(&saved),
            plan,
            termination: None,
        });
    }

    let catalogue = Catalogue::load(&config.catalogue)?;
    let ledger = update_ledger(config, &catalogue, &plan.candidates)?;

    let unblocked = plan
        .candidates
        .difference(&ledger.blocked)
        .copied()
        .collect::<BTreeSet<_>>();
    if !unblocked.is_empty() {
        warn!(jobs = ?unblocked, "Candidates finished in the meantime and stay tested");
    }

    let termination = terminate_registered(&config.paths.pids, std::process::id() as i32)?;

    Ok(Recovery {
        plan,
        ledger,
        termination: Some(termination),
    })
}
