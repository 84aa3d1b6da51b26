pub mod local;
pub mod process;

#[cfg(test)]
mod process_test;

use crate::{
    catalogue::Catalogue,
    checkpoint::WorkerId,
    config::{ConfigErrors, RunnerConfig},
    outcome::{OutcomeCategory, OutcomeError, OutcomeRecord},
    partition::Chunk,
};
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, fmt, io, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to locate the runner binary: {0}")]
    CurrentExe(io::Error),
    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn { worker: WorkerId, source: io::Error },
    #[error("Failed to wait on worker {worker}: {source}")]
    Wait { worker: WorkerId, source: io::Error },
    #[error("Failed to collect worker outcomes: {0}")]
    Outcome(#[from] OutcomeError),
}

/// Aggregated outcome counts of one execution
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub counts: BTreeMap<OutcomeCategory, usize>,
    pub jobs: usize,
    /// workers that didn't finish their chunk
    pub failed_workers: Vec<WorkerId>,
}

impl ExecutionReport {
    pub fn add(&mut self, records: &[OutcomeRecord]) {
        for record in records {
            *self.counts.entry(record.category).or_default() += 1;
        }

        self.jobs += records.len();
    }

    pub fn count(&self, category: OutcomeCategory) -> usize {
        self.counts.get(&category).copied().unwrap_or_default()
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} jobs", self.jobs)?;

        for category in OutcomeCategory::ALL {
            write!(f, " | {category} {}", self.count(category))?;
        }

        if !self.failed_workers.is_empty() {
            write!(f, " | failed workers {:?}", self.failed_workers)?;
        }

        Ok(())
    }
}

pub trait Executor {
    /// run every chunk on its own worker, worker ids are the chunk indices
    fn execute(
        &self,
        catalogue: &Catalogue,
        chunks: &[Chunk],
        run_started: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError>;
}

#[derive(Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
    Process(process::ProcessExecutor),
}

impl Executors {
    /// `config_path` is handed to worker processes so they see the same config
    pub fn load(config: &RunnerConfig, config_path: &Path) -> Result<Self, ConfigErrors> {
        match config.executor.name.as_str() {
            "local" => Ok(Self::Local(local::LocalExecutor::load(config))),
            "process" => Ok(Self::Process(process::ProcessExecutor::load(
                config,
                config_path,
            ))),
            _ => Err(ConfigErrors::UnsupportedExecutor(
                config.executor.name.clone(),
            )),
        }
    }
}

impl Executor for Executors {
    fn execute(
        &self,
        catalogue: &Catalogue,
        chunks: &[Chunk],
        run_started: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError> {
        match self {
            Self::Local(executor) => executor.execute(catalogue, chunks, run_started),
            Self::Process(executor) => executor.execute(catalogue, chunks, run_started),
        }
    }
}
