use super::{ExecutionReport, Executor, ExecutorError};
use crate::{
    catalogue::Catalogue,
    checkpoint::WorkerId,
    config::RunnerConfig,
    evaluator::{exec::ExecEvaluator, Evaluator},
    partition::Chunk,
    worker::{run_worker, WorkerOptions},
};
use chrono::{DateTime, Utc};
use parking_lot::FairMutex;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

/// Executor that runs every chunk on its own thread of a local pool
#[derive(Debug)]
pub struct LocalExecutor {
    evaluator: ExecEvaluator,
    options: WorkerOptions,
    pin_cores: bool,
}

impl LocalExecutor {
    pub fn load(config: &RunnerConfig) -> Self {
        Self {
            evaluator: ExecEvaluator::load(&config.evaluator),
            options: WorkerOptions::from_config(config),
            pin_cores: config.executor.pin_cores,
        }
    }
}

impl Executor for LocalExecutor {
    fn execute(
        &self,
        catalogue: &Catalogue,
        chunks: &[Chunk],
        run_started: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutorError> {
        execute_with(
            &self.evaluator,
            &self.options,
            self.pin_cores,
            catalogue,
            chunks,
            run_started,
        )
    }
}

/// execute the chunks concurrently with a dedicated thread pool, one thread per chunk
#[instrument(level = "info", skip_all, fields(chunks = chunks.len()))]
pub fn execute_with<E: Evaluator>(
    evaluator: &E,
    options: &WorkerOptions,
    pin_cores: bool,
    catalogue: &Catalogue,
    chunks: &[Chunk],
    run_started: DateTime<Utc>,
) -> Result<ExecutionReport, ExecutorError> {
    let thread_number = chunks.len().max(1);
    debug!("Starting thread pool with {thread_number} threads");

    let mut builder = ThreadPoolBuilder::new()
        .num_threads(thread_number)
        .thread_name(|index| format!("worker-{index}"));

    if pin_cores {
        let cores = num_cpus::get().max(1);

        builder = builder.start_handler(move |index| {
            let core = index % cores;

            match affinity::set_thread_affinity([core]) {
                Ok(()) => debug!("Pinned worker thread {index} to core {core}"),
                Err(e) => warn!("Failed to pin worker thread {index} to core {core}: {e}"),
            }
        });
    }

    let pool = builder.build()?;

    // general counters to provide progress
    let total = chunks.iter().map(Vec::len).sum::<usize>() as u64;
    let processed = AtomicU64::new(0);
    let report = FairMutex::new(ExecutionReport::default());

    pool.install(|| {
        chunks.par_iter().enumerate().for_each(|(index, chunk)| {
            let records = run_worker(
                index as WorkerId,
                evaluator,
                options,
                catalogue,
                chunk,
                run_started,
            );

            let done = processed.fetch_add(records.len() as u64, Ordering::SeqCst)
                + records.len() as u64;
            info!("Worker {index} finished, done with {done}/{total}");

            report.lock().add(&records);
        })
    });

    let report = report.into_inner();
    info!(report = %report, "Done with processing");

    Ok(report)
}
