use crate::{
    catalogue::{Catalogue, Job, JobId, ParameterSet},
    checkpoint::{Checkpoint, CheckpointStore, WorkerId, WorkerState},
    config::{PathsConfig, RunnerConfig},
    distributed::fs::FsError,
    evaluator::{EvaluationError, EvaluationRequest, Evaluator},
    metrics::{BestTracker, Evaluation, RankingKey},
    monitor::log::ProgressLog,
    outcome::{AttemptSummary, Classifier, OutcomeCategory, OutcomeRecord, OutcomeSink},
    results::{ResultArtifact, ResultStore},
};
use chrono::{DateTime, Utc};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Everything a worker needs to know besides its chunk
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub dataset: PathBuf,
    pub job_timeout: Duration,
    pub retries: u32,
    pub checkpoint_every: usize,
    pub ranking: RankingKey,
    pub classifier: Classifier,
    pub tag: String,
    pub paths: PathsConfig,
}

impl WorkerOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            dataset: config.dataset.clone(),
            job_timeout: config.evaluator.job_timeout(),
            retries: config.evaluator.retries,
            checkpoint_every: config.checkpoint.every.max(1),
            ranking: config.ranking,
            classifier: config.classifier.classifier(),
            tag: config.monitor.tag.clone(),
            paths: config.paths.clone(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "evaluator panicked".to_string())
}

/// A single worker working through its chunk of jobs in order
pub struct Worker<'a, E: Evaluator + ?Sized> {
    id: WorkerId,
    evaluator: &'a E,
    options: &'a WorkerOptions,
    checkpoints: CheckpointStore,
    results: ResultStore,
    progress: ProgressLog,
    sink: OutcomeSink,
    state: WorkerState,
}

impl<'a, E: Evaluator + ?Sized> Worker<'a, E> {
    /// `run_started` names the outcome document, all workers of a run share it
    pub fn new(
        id: WorkerId,
        evaluator: &'a E,
        options: &'a WorkerOptions,
        run_started: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            evaluator,
            options,
            checkpoints: CheckpointStore::new(&options.paths.checkpoints),
            results: ResultStore::new(&options.paths.results),
            progress: ProgressLog::open(&options.paths.logs, id, &options.tag),
            sink: OutcomeSink::new(&options.paths.outcomes, run_started, id),
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn sink(&self) -> &OutcomeSink {
        &self.sink
    }

    fn transition(&mut self, state: WorkerState) {
        trace!(worker = self.id, from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
    }

    /// stamp and write the checkpoint, failures are logged and never stop the worker
    fn persist(&mut self, checkpoint: &mut Checkpoint) {
        let running = self.state;
        if running == WorkerState::Running {
            self.transition(WorkerState::Checkpointing);
        }

        checkpoint.state = self.state;
        checkpoint.updated_at = Utc::now();

        if let Err(error) = self.checkpoints.write(checkpoint) {
            warn!(worker = self.id, error = %error, "Failed to write checkpoint, continuing");
        }
        self.progress.checkpoint(checkpoint);

        if running == WorkerState::Running {
            self.transition(WorkerState::Running);
        }
    }

    /// Work through `chunk` in order and return one outcome per job
    #[instrument(level = "info", skip_all, fields(worker = self.id, jobs = chunk.len()))]
    pub fn run_chunk(&mut self, catalogue: &Catalogue, chunk: &[JobId]) -> Vec<OutcomeRecord> {
        info!("Starting chunk {:?}", chunk);

        let mut records = Vec::with_capacity(chunk.len());
        let mut last_checkpoint = None;

        for (position, id) in chunk.iter().enumerate() {
            self.transition(WorkerState::Running);

            let record = match catalogue.get(*id) {
                Some(job) => {
                    let (record, checkpoint) = self.run_job(job, position, chunk.len());
                    last_checkpoint = Some(checkpoint);

                    record
                }
                None => {
                    warn!(job = id, "Job is not part of the catalogue");

                    OutcomeRecord {
                        job_id: *id,
                        category: OutcomeCategory::Failed,
                        detail: "job is not part of the catalogue".to_string(),
                    }
                }
            };

            self.sink.record(record.clone());
            records.push(record);
        }

        self.transition(WorkerState::Done);
        if let Some(mut checkpoint) = last_checkpoint {
            checkpoint.chunk_position = chunk.len();
            self.persist(&mut checkpoint);
        }

        info!("Done with chunk");

        records
    }

    /// Run all attempts of a job, ERROR attempts are retried while retries are left
    fn run_job(
        &mut self,
        job: &Job,
        position: usize,
        chunk_len: usize,
    ) -> (OutcomeRecord, Checkpoint) {
        let mut attempt = 0;

        loop {
            let (summary, checkpoint) = self.attempt(job, position, chunk_len);
            let mut record = self.options.classifier.classify(job.id, &summary.attempt);

            if record.category == OutcomeCategory::Error && attempt < self.options.retries {
                attempt += 1;
                warn!(
                    job = job.id,
                    attempt,
                    retries = self.options.retries,
                    detail = %record.detail,
                    "Job attempt errored, retrying"
                );

                continue;
            }

            if record.category.is_success() {
                let written = match (&summary.best_parameters, &summary.attempt.best) {
                    (Some(parameters), Some(evaluation)) => self
                        .write_artifact(job, &summary.attempt, parameters, evaluation)
                        .map_err(|error| error.to_string()),
                    _ => Err("no best parameter set to persist".to_string()),
                };

                if let Err(error) = written {
                    warn!(job = job.id, error = %error, "Failed to persist result artifact");

                    record = OutcomeRecord {
                        job_id: job.id,
                        category: OutcomeCategory::Failed,
                        detail: format!("failed to persist result artifact: {error}"),
                    };
                }
            }

            return (record, checkpoint);
        }
    }

    fn write_artifact(
        &self,
        job: &Job,
        attempt: &AttemptSummary,
        parameters: &ParameterSet,
        evaluation: &Evaluation,
    ) -> Result<PathBuf, FsError> {
        self.results.write(&ResultArtifact {
            job_id: job.id,
            job_label: job.label.clone(),
            ranking: self.options.ranking,
            parameters: parameters.clone(),
            metrics: evaluation.metrics.clone(),
            signals: evaluation.signal_count(),
            total_combos: attempt.total_combos,
            evaluated: attempt.evaluated,
            errors: attempt.errors,
            finished_at: Utc::now(),
        })
    }

    /// a panicking evaluator counts as a failed parameter set
    fn evaluate(&self, request: &EvaluationRequest<'_>) -> Result<Evaluation, EvaluationError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.evaluator.evaluate(request)))
            .unwrap_or_else(|payload| Err(EvaluationError::Raised(panic_message(payload.as_ref()))))
    }

    /// Evaluate every parameter set of the job once, within the job deadline
    #[instrument(level = "debug", skip_all, fields(job = job.id))]
    fn attempt(
        &mut self,
        job: &Job,
        position: usize,
        chunk_len: usize,
    ) -> (JobAttempt, Checkpoint) {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.options.job_timeout)
            .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));
        let total = job.parameter_grid.len();
        let every = self.options.checkpoint_every.max(1);

        // tracks the combo index, the parameter set is only cloned for the final best
        let mut tracker = BestTracker::<usize>::new(self.options.ranking);
        let mut attempt = AttemptSummary {
            total_combos: total,
            ..Default::default()
        };

        let now = Utc::now();
        let mut checkpoint = Checkpoint {
            worker_id: self.id,
            job_id: job.id,
            job_label: job.label.clone(),
            start_time: now,
            current_combo_index: 0,
            total_combos: total,
            best_metrics: None,
            state: self.state,
            updated_at: now,
            chunk_position: position,
            chunk_len,
        };

        info!(label = %job.label, combos = total, "Starting job");
        self.persist(&mut checkpoint);

        for (index, parameters) in job.parameter_grid.iter().enumerate() {
            if Instant::now() >= deadline {
                attempt.timed_out = true;
                break;
            }

            let request = EvaluationRequest {
                job,
                combo_index: index,
                parameters,
                dataset: &self.options.dataset,
                deadline,
            };

            match self.evaluate(&request) {
                Ok(evaluation) => {
                    if tracker.offer(evaluation, index, index) {
                        debug!(combo = index, "New best parameter set");
                    }
                }
                Err(EvaluationError::Timeout) => {
                    attempt.timed_out = true;
                    break;
                }
                Err(error) => {
                    warn!(combo = index, error = %error, "Parameter set failed, continuing");

                    attempt.errors += 1;
                    attempt.last_error = Some(error.to_string());
                }
            }

            attempt.evaluated += 1;

            if attempt.evaluated % every == 0 && attempt.evaluated < total {
                checkpoint.current_combo_index = attempt.evaluated;
                checkpoint.best_metrics = tracker.best_metrics().cloned();
                self.persist(&mut checkpoint);
            }
        }

        // job end, always written
        checkpoint.current_combo_index = attempt.evaluated;
        checkpoint.best_metrics = tracker.best_metrics().cloned();
        self.persist(&mut checkpoint);

        let best = tracker.into_best();
        let best_parameters = best
            .as_ref()
            .and_then(|best| job.parameter_grid.get(best.parameters).cloned());
        attempt.best = best.map(|best| best.evaluation);

        debug!(
            evaluated = attempt.evaluated,
            errors = attempt.errors,
            timed_out = attempt.timed_out,
            "Finished job attempt"
        );

        (
            JobAttempt {
                attempt,
                best_parameters,
            },
            checkpoint,
        )
    }
}

/// Summary of one attempt together with the parameter set of its best evaluation
#[derive(Clone, Debug)]
struct JobAttempt {
    attempt: AttemptSummary,
    best_parameters: Option<ParameterSet>,
}

/// Run a worker over its chunk, used by both the thread pool and the worker process
pub fn run_worker<E: Evaluator + ?Sized>(
    id: WorkerId,
    evaluator: &E,
    options: &WorkerOptions,
    catalogue: &Catalogue,
    chunk: &[JobId],
    run_started: DateTime<Utc>,
) -> Vec<OutcomeRecord> {
    Worker::new(id, evaluator, options, run_started).run_chunk(catalogue, chunk)
}
