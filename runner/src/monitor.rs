pub mod log;
pub mod stall;

use crate::{
    checkpoint::{Checkpoint, CheckpointRead, CheckpointStore, WorkerId, WorkerState},
    config::{MonitorMode, RunnerConfig},
};
use chrono::{DateTime, Duration, Utc};
use self::log::{progress_log_path, LogTail};
use self::stall::StallTracker;
use std::{collections::BTreeMap, fmt::Write as _, io, thread};
use tracing::{debug, info, warn};

/// What the monitor knows about one worker after a tick
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerStatus {
    /// nothing written yet, the worker probably hasn't started
    NoData { worker: WorkerId },
    /// file present but not parsable, likely caught mid-write, retried next tick
    Unreadable { worker: WorkerId, reason: String },
    Active {
        checkpoint: Box<Checkpoint>,
        progress_pct: f64,
        runtime: Duration,
        stalled_for: Option<Duration>,
    },
    /// log mode, the tagged lines appended since the last tick
    Lines {
        worker: WorkerId,
        lines: Vec<String>,
    },
}

impl WorkerStatus {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::NoData { worker }
            | Self::Unreadable { worker, .. }
            | Self::Lines { worker, .. } => *worker,
            Self::Active { checkpoint, .. } => checkpoint.worker_id,
        }
    }
}

/// `HH:MM:SS`, hours are not wrapped at a day
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);

    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn render_status(status: &WorkerStatus, output: &mut String) {
    let _ = match status {
        WorkerStatus::NoData { worker } => writeln!(output, "[worker {worker}] no data yet"),
        WorkerStatus::Unreadable { worker, reason } => writeln!(
            output,
            "[worker {worker}] checkpoint unreadable, retrying next tick ({reason})"
        ),
        WorkerStatus::Lines { worker, lines } => {
            if lines.is_empty() {
                writeln!(output, "[worker {worker}] no new progress lines")
            } else {
                lines
                    .iter()
                    .try_for_each(|line| writeln!(output, "[worker {worker}] {line}"))
            }
        }
        WorkerStatus::Active {
            checkpoint,
            progress_pct,
            runtime,
            stalled_for,
        } => {
            let state = match (checkpoint.state, stalled_for) {
                (WorkerState::Done, _) => "done".to_string(),
                (_, Some(stalled)) => format!("STALLED for {}", format_duration(*stalled)),
                (WorkerState::Idle, None) => "idle".to_string(),
                (WorkerState::Running | WorkerState::Checkpointing, None) => "running".to_string(),
            };
            let best = match &checkpoint.best_metrics {
                Some(metrics) => format!(
                    "best sharpe {:.3} | return {:.4} | drawdown {:.4} | win rate {:.3} | trades {} | pf {:.3}",
                    metrics.sharpe_ratio,
                    metrics.total_return,
                    metrics.max_drawdown,
                    metrics.win_rate,
                    metrics.trade_count,
                    metrics.profit_factor
                ),
                None => "no result yet".to_string(),
            };

            writeln!(
                output,
                "[worker {}] job {} ({}) | combo {}/{} ({progress_pct:.1}%) | chunk {}/{} | runtime {} | {best} | {state}",
                checkpoint.worker_id,
                checkpoint.job_id,
                checkpoint.job_label,
                checkpoint.current_combo_index,
                checkpoint.total_combos,
                checkpoint.chunk_position,
                checkpoint.chunk_len,
                format_duration(*runtime),
            )
        }
    };
}

/// Render one status block per worker, preceded by a timestamp header
pub fn render(statuses: &[WorkerStatus], now: DateTime<Utc>) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "=== {} ===", now.format("%Y-%m-%d %H:%M:%S UTC"));

    for status in statuses {
        render_status(status, &mut output);
    }

    output
}

enum Source {
    Checkpoints {
        store: CheckpointStore,
        stalls: StallTracker,
    },
    Logs {
        tails: BTreeMap<WorkerId, LogTail>,
    },
}

/// Read-only observer of the workers' progress
pub struct Monitor {
    source: Source,
    expected: Vec<WorkerId>,
    interval: std::time::Duration,
}

impl Monitor {
    pub fn load(config: &RunnerConfig) -> Self {
        let expected = (0..config.executor.workers as WorkerId).collect::<Vec<_>>();
        let source = match config.monitor.mode {
            MonitorMode::Checkpoint => Source::Checkpoints {
                store: CheckpointStore::new(&config.paths.checkpoints),
                stalls: StallTracker::new(Duration::seconds(config.monitor.stall_after as i64)),
            },
            MonitorMode::Log => Source::Logs {
                tails: expected
                    .iter()
                    .map(|worker| {
                        (
                            *worker,
                            LogTail::new(
                                progress_log_path(&config.paths.logs, *worker),
                                &config.monitor.tag,
                            ),
                        )
                    })
                    .collect(),
            },
        };

        Self {
            source,
            expected,
            interval: config.monitor.poll_interval(),
        }
    }

    pub fn checkpoints(
        store: CheckpointStore,
        expected: Vec<WorkerId>,
        stall_after: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            source: Source::Checkpoints {
                store,
                stalls: StallTracker::new(stall_after),
            },
            expected,
            interval,
        }
    }

    pub fn logs(tails: Vec<(WorkerId, LogTail)>, interval: std::time::Duration) -> Self {
        Self {
            expected: tails.iter().map(|(worker, _)| *worker).collect(),
            source: Source::Logs {
                tails: tails.into_iter().collect(),
            },
            interval,
        }
    }

    /// Read the current state of every expected worker and any other worker found on disk.
    /// Failures are reported per worker and never abort the tick.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<WorkerStatus> {
        match &mut self.source {
            Source::Checkpoints { store, stalls } => {
                let mut workers = self.expected.clone();
                match store.workers() {
                    Ok(found) => workers.extend(found),
                    Err(error) => {
                        warn!(error = %error, "Failed to list checkpoints, retrying next tick")
                    }
                }
                workers.sort_unstable();
                workers.dedup();

                workers
                    .into_iter()
                    .map(|worker| match store.read(worker) {
                        CheckpointRead::Missing => {
                            stalls.forget(worker);

                            WorkerStatus::NoData { worker }
                        }
                        CheckpointRead::Unreadable(reason) => {
                            WorkerStatus::Unreadable { worker, reason }
                        }
                        CheckpointRead::Present(checkpoint) => WorkerStatus::Active {
                            progress_pct: checkpoint.progress_pct(),
                            runtime: checkpoint.runtime(now),
                            stalled_for: stalls.observe(&checkpoint, now),
                            checkpoint,
                        },
                    })
                    .collect()
            }
            Source::Logs { tails } => tails
                .iter_mut()
                .map(|(worker, tail)| match tail.poll() {
                    Ok(Some(lines)) => WorkerStatus::Lines {
                        worker: *worker,
                        lines,
                    },
                    Ok(None) => WorkerStatus::NoData { worker: *worker },
                    Err(error) => {
                        debug!(path = ?tail.path(), error = %error, "Failed to read progress log");

                        WorkerStatus::Unreadable {
                            worker: *worker,
                            reason: error.to_string(),
                        }
                    }
                })
                .collect(),
        }
    }

    /// Poll and render on a fixed interval until `max_ticks` is reached, forever if `None`
    pub fn run(&mut self, max_ticks: Option<u64>, output: &mut impl io::Write) -> io::Result<()> {
        info!(
            interval = ?self.interval,
            workers = self.expected.len(),
            "Starting monitor"
        );
        let mut tick = 0u64;

        loop {
            let now = Utc::now();
            let statuses = self.poll(now);
            output.write_all(render(&statuses, now).as_bytes())?;
            output.flush()?;

            tick += 1;
            if max_ticks.map_or(false, |max| tick >= max) {
                return Ok(());
            }

            thread::sleep(self.interval);
        }
    }
}
