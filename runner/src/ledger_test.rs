use crate::{
    catalogue::JobId,
    ledger::{Ledger, LedgerError, LedgerSummary},
    outcome::{OutcomeCategory, OutcomeDocument, OutcomeHistory, OutcomeRecord},
};
use chrono::Utc;
use std::{collections::BTreeSet, fs};

fn ids(ids: impl IntoIterator<Item = JobId>) -> BTreeSet<JobId> {
    ids.into_iter().collect()
}

fn history(records: &[(JobId, OutcomeCategory)]) -> OutcomeHistory {
    let mut document = OutcomeDocument::new(Utc::now());
    for (job_id, category) in records {
        document.record(OutcomeRecord {
            job_id: *job_id,
            category: *category,
            detail: String::new(),
        });
    }

    let mut history = OutcomeHistory::default();
    history.merge(&document);

    history
}

#[test]
pub fn twenty_jobs_four_tested_two_blocked() {
    let catalogue = ids(1..=20);
    let ledger = Ledger::recompute(
        &catalogue,
        &ids([3, 7, 12, 19]),
        &OutcomeHistory::default(),
        &ids([5, 9]),
    )
    .unwrap();

    assert_eq!(ledger.already_tested, ids([3, 7, 12, 19]));
    assert_eq!(ledger.blocked, ids([5, 9]));
    assert!(ledger.problem.is_empty());
    assert_eq!(
        ledger.to_run,
        ids([1, 2, 4, 6, 8, 10, 11, 13, 14, 15, 16, 17, 18, 20])
    );
    assert_eq!(
        ledger.summary(),
        LedgerSummary {
            total: 20,
            skip: 6,
            to_run: 14,
            already_tested: 4,
            problem: 0,
            blocked: 2,
        }
    );
}

#[test]
pub fn precedence_keeps_sets_disjoint() {
    let catalogue = ids(1..=10);
    let outcomes = history(&[
        (3, OutcomeCategory::Error),
        (5, OutcomeCategory::TimeoutSignals),
        (6, OutcomeCategory::FewSignals),
        (8, OutcomeCategory::Success),
    ]);

    let ledger = Ledger::recompute(&catalogue, &ids([3, 4]), &outcomes, &ids([4, 5])).unwrap();

    // already tested > blocked > problem
    assert_eq!(ledger.already_tested, ids([3, 4]));
    assert_eq!(ledger.blocked, ids([5]));
    assert_eq!(ledger.problem, ids([6]));
    // a success without artifact is run again
    assert!(ledger.to_run.contains(&8));
    assert!(ledger.check_disjoint().is_ok());
    assert_eq!(ledger.all(), catalogue);
}

#[test]
pub fn recompute_is_idempotent() {
    let catalogue = ids(1..=30);
    let artifacts = ids([2, 4, 8, 16]);
    let outcomes = history(&[(9, OutcomeCategory::Failed), (27, OutcomeCategory::Error)]);

    let first = Ledger::recompute(&catalogue, &artifacts, &outcomes, &ids([1, 2, 3])).unwrap();
    let second = Ledger::recompute(&catalogue, &artifacts, &outcomes, &first.block_list).unwrap();

    assert_eq!(first, second);
}

#[test]
pub fn unknown_ids_are_dropped() {
    let ledger = Ledger::recompute(
        &ids(1..=5),
        &ids([1, 99]),
        &history(&[(42, OutcomeCategory::Error)]),
        &ids([77]),
    )
    .unwrap();

    assert_eq!(ledger.already_tested, ids([1]));
    assert!(ledger.blocked.is_empty());
    assert!(ledger.problem.is_empty());
    assert_eq!(ledger.to_run, ids(2..=5));
}

#[test]
pub fn validate_detects_violations() {
    let overlapping = Ledger {
        already_tested: ids([1, 2]),
        problem: ids([2]),
        blocked: BTreeSet::new(),
        to_run: ids([3]),
        ..Default::default()
    };
    assert!(matches!(
        overlapping.validate(&ids(1..=3)),
        Err(LedgerError::Inconsistent(_))
    ));

    let incomplete = Ledger {
        to_run: ids([1, 2]),
        ..Default::default()
    };
    assert!(matches!(
        incomplete.validate(&ids(1..=3)),
        Err(LedgerError::Inconsistent(_))
    ));
}

#[test]
pub fn with_blocked_moves_pending_and_problem_jobs() {
    let ledger = Ledger {
        already_tested: ids([1]),
        problem: ids([2]),
        blocked: ids([3]),
        to_run: ids([4, 5, 6]),
        block_list: ids([3]),
    };

    let blocked = ledger.with_blocked(&ids([1, 2, 4, 99]));

    assert_eq!(blocked.already_tested, ids([1]));
    assert!(blocked.problem.is_empty());
    assert_eq!(blocked.blocked, ids([2, 3, 4]));
    assert_eq!(blocked.to_run, ids([5, 6]));
    assert_eq!(blocked.all(), ledger.all());
    // the tested and the unknown id are remembered as blocks all the same
    assert_eq!(blocked.block_list, ids([1, 2, 3, 4, 99]));
}

#[test]
pub fn blocks_survive_a_removed_artifact() {
    let catalogue = ids(1..=6);
    let outcomes = OutcomeHistory::default();

    let first = Ledger::recompute(&catalogue, &ids([5]), &outcomes, &ids([5, 6])).unwrap();
    assert_eq!(first.already_tested, ids([5]));
    assert_eq!(first.blocked, ids([6]));
    assert_eq!(first.block_list, ids([5, 6]));

    // the results directory got cleaned in between
    let second = Ledger::recompute(&catalogue, &BTreeSet::new(), &outcomes, &first.block_list).unwrap();
    assert_eq!(second.blocked, ids([5, 6]));
    assert!(!second.to_run.contains(&5));

    // same through the saved file
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    first.save(&path).unwrap();
    let loaded = Ledger::load(&path).unwrap().unwrap();
    assert_eq!(loaded.block_list, ids([5, 6]));

    let third = Ledger::recompute(&catalogue, &BTreeSet::new(), &outcomes, &loaded.block_list).unwrap();
    assert_eq!(third, second);
}

#[test]
pub fn save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("ledger.json");
    assert_eq!(Ledger::load(&path).unwrap(), None);

    let ledger = Ledger::recompute(
        &ids(1..=20),
        &ids([3, 7, 12, 19]),
        &history(&[(11, OutcomeCategory::FewSignals)]),
        &ids([5, 9]),
    )
    .unwrap();
    ledger.save(&path).unwrap();

    let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(value["skip_indicators"], serde_json::json!([3, 5, 7, 9, 11, 12, 19]));
    assert_eq!(value["problem_indicators"], serde_json::json!([11]));
    assert_eq!(value["summary"]["to_run"], 13);
    assert_eq!(value["block_list"], serde_json::json!([5, 9]));

    assert_eq!(Ledger::load(&path).unwrap(), Some(ledger));
}

#[test]
pub fn load_derives_blocked_from_older_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    fs::write(
        &path,
        r#"{
            "skip_indicators": [3, 5, 9],
            "stable_success": [1, 2],
            "already_tested": [3],
            "problem_indicators": [9],
            "summary": {"total": 5, "skip": 3, "to_run": 2, "already_tested": 1, "problem": 1, "blocked": 1}
        }"#,
    )
    .unwrap();

    let ledger = Ledger::load(&path).unwrap().unwrap();

    assert_eq!(ledger.blocked, ids([5]));
    assert_eq!(ledger.block_list, ids([5]));
    assert_eq!(ledger.to_run, ids([1, 2]));
}

#[test]
pub fn load_rejects_inconsistent_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");

    let documents = [
        // 2 is both pending and tested
        r#"{"skip_indicators": [2], "stable_success": [1, 2], "already_tested": [2],
            "problem_indicators": [], "blocked_indicators": [],
            "summary": {"total": 2, "skip": 1, "to_run": 2, "already_tested": 1, "problem": 0, "blocked": 0}}"#,
        // skip list isn't the union of the excluded sets
        r#"{"skip_indicators": [2, 4], "stable_success": [1], "already_tested": [2],
            "problem_indicators": [], "blocked_indicators": [],
            "summary": {"total": 2, "skip": 1, "to_run": 1, "already_tested": 1, "problem": 0, "blocked": 0}}"#,
        // summary doesn't match the sets
        r#"{"skip_indicators": [2], "stable_success": [1], "already_tested": [2],
            "problem_indicators": [], "blocked_indicators": [],
            "summary": {"total": 9, "skip": 1, "to_run": 1, "already_tested": 1, "problem": 0, "blocked": 0}}"#,
    ];

    for document in documents {
        fs::write(&path, document).unwrap();

        assert!(
            matches!(Ledger::load(&path), Err(LedgerError::Inconsistent(_))),
            "accepted {document}"
        );
    }

    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(Ledger::load(&path), Err(LedgerError::Parse { .. })));
}
