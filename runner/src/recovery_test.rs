use crate::{
    catalogue::JobId,
    config::RunnerConfig,
    ledger::Ledger,
    partition::partition,
    pipeline,
    recovery::{plan_recovery, terminate_registered},
};
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    fs,
    path::Path,
    process::{Command, Stdio},
};

fn ids(ids: impl IntoIterator<Item = JobId>) -> BTreeSet<JobId> {
    ids.into_iter().collect()
}

fn pending(to_run: BTreeSet<JobId>) -> Ledger {
    Ledger {
        to_run,
        ..Default::default()
    }
}

/// config rooted in `dir` with a catalogue of jobs 1..=jobs
fn config_in(dir: &Path, jobs: JobId, workers: usize) -> RunnerConfig {
    let catalogue = (1..=jobs)
        .map(|id| format!("  - {{ id: {id}, label: indicator_{id} }}"))
        .join("\n");
    fs::write(dir.join("catalogue.yaml"), format!("jobs:\n{catalogue}\n")).unwrap();

    let mut config = RunnerConfig::from_yaml(&format!(
        "catalogue: catalogue.yaml\ndataset: data.csv\nexecutor: {{ workers: {workers} }}\nevaluator: {{ exec: backtest, timeout: 60 }}\n"
    ))
    .unwrap();
    config.rebase(dir);

    config
}

#[test]
pub fn heads_of_five_five_five_four() {
    let ledger = pending(ids(1..=19));
    let plan = plan_recovery(&ledger, 4).unwrap();

    assert_eq!(plan.chunks.iter().map(Vec::len).collect_vec(), vec![5, 5, 5, 4]);
    assert_eq!(plan.candidates, ids([1, 6, 11, 16]));

    let recovered = plan.apply(&ledger);
    assert_eq!(recovered.blocked, ids([1, 6, 11, 16]));
    assert_eq!(recovered.to_run.len(), 15);

    // the next run never hands a blocked head to a worker again
    let next = partition(&recovered.to_run, 4).unwrap();
    assert_eq!(next.iter().map(Vec::len).collect_vec(), vec![4, 4, 4, 3]);
    assert!(next
        .iter()
        .flatten()
        .all(|id| !plan.candidates.contains(id)));
}

#[test]
pub fn tested_heads_stay_tested() {
    let ledger = Ledger {
        already_tested: ids([20]),
        to_run: ids(1..=8),
        ..Default::default()
    };
    let plan = plan_recovery(&ledger, 2).unwrap();

    assert_eq!(plan.candidates, ids([1, 5]));
    assert_eq!(plan.apply(&ledger).already_tested, ids([20]));
}

#[test]
pub fn nothing_pending_nothing_to_block() {
    let plan = plan_recovery(&pending(BTreeSet::new()), 4).unwrap();

    assert!(plan.chunks.is_empty());
    assert!(plan.candidates.is_empty());
    assert!(plan_recovery(&pending(ids([1])), 0).is_err());
}

#[test]
pub fn terminate_signals_live_and_drops_stale() {
    let dir = tempfile::tempdir().unwrap();

    let mut live = Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let mut gone = Command::new("true").spawn().unwrap();
    let gone_pid = gone.id();
    gone.wait().unwrap();

    let own = std::process::id() as i32;
    fs::write(dir.path().join("worker_0.pid"), live.id().to_string()).unwrap();
    fs::write(dir.path().join("worker_1.pid"), gone_pid.to_string()).unwrap();
    fs::write(dir.path().join("run.pid"), own.to_string()).unwrap();
    fs::write(dir.path().join("broken.pid"), "0").unwrap();

    let termination = terminate_registered(dir.path(), own).unwrap();

    assert_eq!(termination.signalled, vec![live.id() as i32]);
    assert_eq!(termination.stale, vec![dir.path().join("worker_1.pid")]);
    assert_eq!(termination.failed.len(), 1);
    assert!(!dir.path().join("worker_1.pid").exists());
    // the caller's own registration is left alone
    assert!(dir.path().join("run.pid").exists());

    let status = live.wait().unwrap();
    assert!(!status.success());
}

#[test]
pub fn recover_blocks_heads_of_the_saved_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 19, 4);

    assert!(matches!(
        pipeline::recover(&config, true),
        Err(pipeline::RunnerError::NoLedger(_))
    ));

    let catalogue = crate::catalogue::Catalogue::load(&config.catalogue).unwrap();
    let saved = pipeline::update_ledger(&config, &catalogue, &BTreeSet::new()).unwrap();
    assert_eq!(saved.to_run, ids(1..=19));

    let dry = pipeline::recover(&config, true).unwrap();
    assert_eq!(dry.plan.candidates, ids([1, 6, 11, 16]));
    assert!(dry.termination.is_none());
    // a dry run doesn't touch the saved ledger
    assert_eq!(Ledger::load(&config.paths.ledger).unwrap(), Some(saved));

    let recovery = pipeline::recover(&config, false).unwrap();
    assert_eq!(recovery.ledger.blocked, ids([1, 6, 11, 16]));
    assert!(recovery.termination.unwrap().signalled.is_empty());

    // blocks survive the next recompute
    let (ledger, chunks) = pipeline::plan_chunks(&config, &catalogue).unwrap();
    assert_eq!(ledger.blocked, ids([1, 6, 11, 16]));
    assert_eq!(chunks.iter().map(Vec::len).collect_vec(), vec![4, 4, 4, 3]);
    assert_eq!(chunks[0], vec![2, 3, 4, 5]);
}
