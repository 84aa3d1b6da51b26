use super::{ExecutionReport, Executor, ExecutorError};
use crate::{
    catalogue::{Catalogue, JobId},
    checkpoint::WorkerId,
    config::RunnerConfig,
    outcome::{OutcomeDocument, OutcomeRecord},
    partition::Chunk,
};
use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;
use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, Command},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Executor that starts one runner process per chunk, isolating the workers from each other
#[derive(Debug)]
pub struct ProcessExecutor {
    config_path: PathBuf,
    outcomes: PathBuf,
    chunk_timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn load(config: &RunnerConfig, config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            outcomes: config.paths.outcomes.clone(),
            chunk_timeout: config.executor.chunk_timeout.map(Duration::from_secs),
        }
    }

    /// arguments of the `worker` subcommand for one chunk
    pub fn worker_args(
        &self,
        worker: WorkerId,
        chunk: &[JobId],
        run_started: DateTime<Utc>,
    ) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_path.to_string_lossy().into_owned(),
            "worker".to_string(),
            "--id".to_string(),
            worker.to_string(),
            "--jobs".to_string(),
            chunk.iter().join(","),
            "--run-stamp".to_string(),
            run_started.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ]
    }

    fn spawn(
        &self,
        binary: &Path,
        worker: WorkerId,
        chunk: &[JobId],
        run_started: DateTime<Utc>,
    ) -> Result<Child, ExecutorError> {
        Command::new(binary)
            .args(self.worker_args(worker, chunk, run_started))
            .spawn()
            .map_err(|source| ExecutorError::Spawn { worker, source })
    }

    /// wait for the worker, killing it once the chunk timeout has passed. Returns true on a clean exit
    fn wait(
        &self,
        worker: WorkerId,
        child: &mut Child,
        started: Instant,
    ) -> Result<bool, ExecutorError> {
        let wait_error = |source: io::Error| ExecutorError::Wait { worker, source };

        let status = match self.chunk_timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(started.elapsed());

                match child.wait_timeout(remaining).map_err(wait_error)? {
                    Some(status) => status,
                    None => {
                        warn!("Worker {worker} exceeded the chunk timeout, killing it");
                        child.kill().map_err(wait_error)?;
                        child.wait().map_err(wait_error)?;

                        return Ok(false);
                    }
                }
            }
            None => child.wait().map_err(wait_error)?,
        };

        debug!("Worker {worker} exited with {status}");

        Ok(status.success())
    }

    /// records of the outcome document `worker` left behind, if any
    fn worker_outcomes(
        &self,
        worker: WorkerId,
        run_started: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>, ExecutorError> {
        let path = OutcomeDocument::new(run_started).path(&self.outcomes, &format!("w{worker}"));
        if !path.is_file() {
            warn!(path = ?path, "Worker {worker} left no outcome document");
            return Ok(Vec::new());
        }

        let document = OutcomeDocument::load(&path)?;

        Ok(document
            .categories()
            .map(|(job_id, category)| OutcomeRecord {
                job_id,
                category,
                detail: document.details.get(&job_id).cloned().unwrap_or_default(),
            })
            .collect_vec())
    }

    /// wait for every worker and gather their outcomes. Every child is reaped before the
    /// first error, if any, is returned
    pub(super) fn collect(
        &self,
        children: Vec<(WorkerId, Child)>,
        started: Instant,
        run_started: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut report = ExecutionReport::default();
        let mut first_error = None;

        for (worker, mut child) in children {
            let clean = match self.wait(worker, &mut child, started) {
                Ok(clean) => clean,
                Err(wait_error) => {
                    error!(error = %wait_error, "Lost track of worker {worker}, killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    first_error.get_or_insert(wait_error);

                    false
                }
            };

            if !clean {
                error!("Worker {worker} didn't finish its chunk");
                report.failed_workers.push(worker);
            }

            // the worker rewrites its document after every job, so even a killed worker
            // leaves the outcomes of its finished jobs behind
            match self.worker_outcomes(worker, run_started) {
                Ok(records) => report.add(&records),
                Err(outcome_error) => {
                    error!(error = %outcome_error, "Failed to read the outcomes of worker {worker}");
                    first_error.get_or_insert(outcome_error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }
}

impl Executor for ProcessExecutor {
    #[instrument(level = "info", skip_all, fields(chunks = chunks.len()))]
    fn execute(
        &self,
        _catalogue: &Catalogue,
        chunks: &[Chunk],
        run_started: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let binary = std::env::current_exe().map_err(ExecutorError::CurrentExe)?;
        let started = Instant::now();

        let mut children = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let worker = index as WorkerId;

            match self.spawn(&binary, worker, chunk, run_started) {
                Ok(child) => {
                    debug!("Started worker {worker} as process {}", child.id());
                    children.push((worker, child));
                }
                Err(spawn_error) => {
                    // don't leave the already started workers running unattended
                    for (_, child) in children.iter_mut() {
                        let _ = child.kill();
                        let _ = child.wait();
                    }

                    return Err(spawn_error);
                }
            }
        }

        let report = self.collect(children, started, run_started)?;

        info!(report = %report, "Done with processing");

        Ok(report)
    }
}
