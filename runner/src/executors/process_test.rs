use super::{process::ProcessExecutor, ExecutorError};
use crate::{
    config::RunnerConfig,
    outcome::{OutcomeCategory, OutcomeDocument, OutcomeRecord},
};
use chrono::{TimeZone, Utc};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use std::{
    fs,
    path::Path,
    process::Command,
    time::{Duration, Instant},
};

fn executor(outcomes: &Path) -> ProcessExecutor {
    let config = RunnerConfig::from_yaml(&format!(
        "catalogue: catalogue.yaml\ndataset: data.csv\nexecutor: {{ name: process, chunk_timeout: 1 }}\nevaluator: {{ exec: backtest, timeout: 60 }}\npaths: {{ outcomes: '{}' }}\n",
        outcomes.display()
    ))
    .unwrap();

    ProcessExecutor::load(&config, Path::new("runner.yaml"))
}

#[test]
pub fn timed_out_worker_keeps_its_finished_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path());
    let run_started = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();

    let mut document = OutcomeDocument::new(run_started);
    document.record(OutcomeRecord {
        job_id: 5,
        category: OutcomeCategory::Success,
        detail: "sharpe 1.2".to_string(),
    });
    document.save(dir.path(), "w0").unwrap();

    let children = vec![
        (0, Command::new("sleep").arg("30").spawn().unwrap()),
        (1, Command::new("true").spawn().unwrap()),
    ];

    let started = Instant::now();
    let report = executor.collect(children, started, run_started).unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.failed_workers, vec![0]);
    assert_eq!(report.jobs, 1);
    assert_eq!(report.count(OutcomeCategory::Success), 1);
}

#[test]
pub fn every_worker_is_reaped_before_an_error_returns() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path());
    let run_started = Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap();

    // worker 0 leaves a broken document behind while worker 1 is still busy
    let broken = OutcomeDocument::new(run_started).path(dir.path(), "w0");
    fs::write(&broken, "{ not json").unwrap();

    let busy = Command::new("sleep").arg("30").spawn().unwrap();
    let busy_pid = Pid::from_raw(busy.id() as i32);
    let children = vec![(0, Command::new("true").spawn().unwrap()), (1, busy)];

    let result = executor.collect(children, Instant::now(), run_started);

    assert!(matches!(result, Err(ExecutorError::Outcome(_))), "{result:?}");
    // gone for good, a zombie would still accept the signal
    assert_eq!(kill(busy_pid, None), Err(Errno::ESRCH));
}
