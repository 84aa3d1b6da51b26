use crate::{
    catalogue::JobId,
    distributed::fs::{write_json_atomic, FsError},
    outcome::OutcomeHistory,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger is inconsistent: {0}")]
    Inconsistent(String),
    #[error("Failed to read ledger {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Ledger {path:?} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write ledger: {0}")]
    Write(#[from] FsError),
}

/// Partition of all catalogued jobs into already tested, problem, blocked and to run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    pub already_tested: BTreeSet<JobId>,
    pub problem: BTreeSet<JobId>,
    pub blocked: BTreeSet<JobId>,
    pub to_run: BTreeSet<JobId>,
    /// every id ever blocked, also the ones shadowed by an artifact or gone from the catalogue
    pub block_list: BTreeSet<JobId>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub total: usize,
    pub skip: usize,
    pub to_run: usize,
    pub already_tested: usize,
    pub problem: usize,
    pub blocked: usize,
}

impl fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} | to run {} | skip {} (already tested {}, problem {}, blocked {})",
            self.total, self.to_run, self.skip, self.already_tested, self.problem, self.blocked
        )
    }
}

/// On-disk representation of the ledger
#[derive(Deserialize, Serialize, Clone, Debug)]
struct LedgerDocument {
    skip_indicators: BTreeSet<JobId>,
    stable_success: BTreeSet<JobId>,
    already_tested: BTreeSet<JobId>,
    problem_indicators: BTreeSet<JobId>,
    #[serde(default)]
    blocked_indicators: Option<BTreeSet<JobId>>,
    #[serde(default)]
    block_list: Option<BTreeSet<JobId>>,
    summary: LedgerSummary,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Ids from `set` that aren't part of the catalogue, logged and dropped
fn restrict(set: &BTreeSet<JobId>, catalogue: &BTreeSet<JobId>, name: &str) -> BTreeSet<JobId> {
    let (known, unknown): (BTreeSet<JobId>, BTreeSet<JobId>) =
        set.iter().partition(|id| catalogue.contains(*id));

    if !unknown.is_empty() {
        warn!(
            set = name,
            ids = ?unknown,
            "Ignoring ids that are not part of the catalogue"
        );
    }

    known
}

impl Ledger {
    /// Derive the ledger from its inputs without touching the file system.
    ///
    /// `blocks` is the union of manual blocks and the previous block list. Each job
    /// lands in exactly one set, with precedence already tested > blocked > problem,
    /// while the block list keeps all of `blocks`.
    pub fn recompute(
        catalogue: &BTreeSet<JobId>,
        artifacts: &BTreeSet<JobId>,
        outcomes: &OutcomeHistory,
        blocks: &BTreeSet<JobId>,
    ) -> Result<Self, LedgerError> {
        let already_tested = restrict(artifacts, catalogue, "already_tested");
        let blocked = &restrict(blocks, catalogue, "blocked") - &already_tested;
        let problem = &(&restrict(&outcomes.problem_ids(), catalogue, "problem") - &already_tested)
            - &blocked;

        let excluded = already_tested
            .iter()
            .chain(blocked.iter())
            .chain(problem.iter())
            .copied()
            .collect::<BTreeSet<_>>();
        let to_run = catalogue - &excluded;

        let ledger = Self {
            already_tested,
            problem,
            blocked,
            to_run,
            block_list: blocks.clone(),
        };
        ledger.validate(catalogue)?;

        Ok(ledger)
    }

    /// move `ids` into the blocked set, already tested jobs stay where they are
    pub fn with_blocked(&self, ids: &BTreeSet<JobId>) -> Self {
        let new_blocks = ids - &self.already_tested;

        Self {
            already_tested: self.already_tested.clone(),
            problem: &self.problem - &new_blocks,
            blocked: &self.blocked | &(&new_blocks & &self.all()),
            to_run: &self.to_run - &new_blocks,
            block_list: &self.block_list | ids,
        }
    }

    /// union of all four sets
    pub fn all(&self) -> BTreeSet<JobId> {
        self.already_tested
            .iter()
            .chain(self.problem.iter())
            .chain(self.blocked.iter())
            .chain(self.to_run.iter())
            .copied()
            .collect()
    }

    /// problem ∪ blocked ∪ already tested
    pub fn skip(&self) -> BTreeSet<JobId> {
        &(&self.already_tested | &self.problem) | &self.blocked
    }

    /// check the four sets are pairwise disjoint
    pub fn check_disjoint(&self) -> Result<(), LedgerError> {
        let sets = [
            ("already_tested", &self.already_tested),
            ("problem", &self.problem),
            ("blocked", &self.blocked),
            ("to_run", &self.to_run),
        ];

        for ((left_name, left), (right_name, right)) in sets.iter().tuple_combinations() {
            let overlap = left.intersection(right).copied().collect_vec();

            if !overlap.is_empty() {
                return Err(LedgerError::Inconsistent(format!(
                    "ids {overlap:?} appear in both {left_name} and {right_name}"
                )));
            }
        }

        Ok(())
    }

    /// disjoint and covering exactly the catalogue, anything else is fatal
    pub fn validate(&self, catalogue: &BTreeSet<JobId>) -> Result<(), LedgerError> {
        self.check_disjoint()?;

        let all = self.all();
        if &all != catalogue {
            let missing = catalogue.difference(&all).copied().collect_vec();
            let unknown = all.difference(catalogue).copied().collect_vec();

            return Err(LedgerError::Inconsistent(format!(
                "ledger doesn't cover the catalogue, missing {missing:?}, unknown {unknown:?}"
            )));
        }

        Ok(())
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            total: self.all().len(),
            skip: self.skip().len(),
            to_run: self.to_run.len(),
            already_tested: self.already_tested.len(),
            problem: self.problem.len(),
            blocked: self.blocked.len(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        self.check_disjoint()?;

        let document = LedgerDocument {
            skip_indicators: self.skip(),
            stable_success: self.to_run.clone(),
            already_tested: self.already_tested.clone(),
            problem_indicators: self.problem.clone(),
            blocked_indicators: Some(self.blocked.clone()),
            block_list: Some(self.block_list.clone()),
            summary: self.summary(),
            updated_at: Some(Utc::now()),
        };
        write_json_atomic(path, &document)?;

        info!(path = ?path, summary = %document.summary, "Saved ledger");

        Ok(())
    }

    /// load a previously saved ledger, `None` if there is none yet
    pub fn load(path: &Path) -> Result<Option<Self>, LedgerError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let document: LedgerDocument =
            serde_json::from_slice(&content).map_err(|source| LedgerError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_document(document).map(Some)
    }

    fn from_document(document: LedgerDocument) -> Result<Self, LedgerError> {
        let blocked = match document.blocked_indicators {
            Some(blocked) => blocked,
            // older files only carry the combined skip list
            None => {
                &(&document.skip_indicators - &document.already_tested)
                    - &document.problem_indicators
            }
        };

        let block_list = document.block_list.unwrap_or_else(|| blocked.clone());
        if !blocked.is_subset(&block_list) {
            return Err(LedgerError::Inconsistent(
                "blocked_indicators isn't part of the block list".into(),
            ));
        }

        let ledger = Self {
            already_tested: document.already_tested,
            problem: document.problem_indicators,
            blocked,
            to_run: document.stable_success,
            block_list,
        };
        ledger.check_disjoint()?;

        if ledger.skip() != document.skip_indicators {
            return Err(LedgerError::Inconsistent(
                "skip_indicators isn't the union of already tested, problem and blocked".into(),
            ));
        }

        let summary = ledger.summary();
        if summary != document.summary {
            return Err(LedgerError::Inconsistent(format!(
                "summary {} doesn't match the stored sets ({summary})",
                document.summary
            )));
        }

        Ok(ledger)
    }
}
