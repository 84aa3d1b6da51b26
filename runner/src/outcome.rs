use crate::{
    catalogue::JobId,
    checkpoint::WorkerId,
    distributed::{
        fs::{write_json_atomic, FsError},
        util::matching_files,
    },
    metrics::Evaluation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const OUTCOME_GLOB: &str = "outcomes_*.json";

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error("Failed to read outcome document {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Outcome document {path:?} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write outcome document: {0}")]
    Write(#[from] FsError),
    #[error("Invalid outcome file pattern: {0}")]
    Glob(#[from] globset::Error),
}

/// Terminal classification of one job attempt
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutcomeCategory {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR_SIGNALS", alias = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT_SIGNALS")]
    TimeoutSignals,
    #[serde(rename = "FEW_SIGNALS")]
    FewSignals,
    #[serde(rename = "FAILED")]
    Failed,
}

impl OutcomeCategory {
    pub const ALL: [OutcomeCategory; 5] = [
        Self::Success,
        Self::Error,
        Self::TimeoutSignals,
        Self::FewSignals,
        Self::Failed,
    ];

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::TimeoutSignals => "TIMEOUT_SIGNALS",
            Self::FewSignals => "FEW_SIGNALS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutcomeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct OutcomeRecord {
    pub job_id: JobId,
    pub category: OutcomeCategory,
    pub detail: String,
}

/// What a worker observed while evaluating one job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttemptSummary {
    pub total_combos: usize,
    pub evaluated: usize,
    pub errors: usize,
    pub timed_out: bool,
    pub best: Option<Evaluation>,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct Classifier {
    pub min_signals: u64,
    pub use_fallback_signals: bool,
}

impl Classifier {
    /// Assign exactly one category to a finished attempt
    pub fn classify(&self, job_id: JobId, attempt: &AttemptSummary) -> OutcomeRecord {
        let (category, detail) = if attempt.timed_out {
            (
                OutcomeCategory::TimeoutSignals,
                format!(
                    "deadline reached after {}/{} parameter sets",
                    attempt.evaluated, attempt.total_combos
                ),
            )
        } else if let Some(best) = &attempt.best {
            let signals = self.effective_signals(best);

            if signals >= self.min_signals {
                (
                    OutcomeCategory::Success,
                    format!(
                        "{signals} signals, {} of {} parameter sets failed",
                        attempt.errors, attempt.total_combos
                    ),
                )
            } else {
                (
                    OutcomeCategory::FewSignals,
                    format!("{signals} signals, below the floor of {}", self.min_signals),
                )
            }
        } else if attempt.errors > 0 {
            (
                OutcomeCategory::Error,
                format!(
                    "all {} evaluated parameter sets failed, last error: {}",
                    attempt.errors,
                    attempt.last_error.as_deref().unwrap_or("unknown")
                ),
            )
        } else {
            (
                OutcomeCategory::Failed,
                "evaluation produced no result".to_string(),
            )
        };

        OutcomeRecord {
            job_id,
            category,
            detail,
        }
    }

    fn effective_signals(&self, evaluation: &Evaluation) -> u64 {
        let signals = evaluation.signal_count();

        match evaluation.fallback_signals {
            Some(fallback) if self.use_fallback_signals && signals < self.min_signals => {
                signals.max(fallback)
            }
            _ => signals,
        }
    }
}

/// Result of one classification run, category -> job ids
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct OutcomeDocument {
    pub created_at: DateTime<Utc>,
    #[serde(rename = "SUCCESS", default)]
    pub success: BTreeSet<JobId>,
    #[serde(rename = "ERROR_SIGNALS", alias = "ERROR", default)]
    pub error: BTreeSet<JobId>,
    #[serde(rename = "TIMEOUT_SIGNALS", default)]
    pub timeout_signals: BTreeSet<JobId>,
    #[serde(rename = "FEW_SIGNALS", default)]
    pub few_signals: BTreeSet<JobId>,
    #[serde(rename = "FAILED", default)]
    pub failed: BTreeSet<JobId>,
    #[serde(default)]
    pub details: BTreeMap<JobId, String>,
}

impl Default for OutcomeDocument {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl OutcomeDocument {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            success: BTreeSet::new(),
            error: BTreeSet::new(),
            timeout_signals: BTreeSet::new(),
            few_signals: BTreeSet::new(),
            failed: BTreeSet::new(),
            details: BTreeMap::new(),
        }
    }

    pub fn ids(&self, category: OutcomeCategory) -> &BTreeSet<JobId> {
        match category {
            OutcomeCategory::Success => &self.success,
            OutcomeCategory::Error => &self.error,
            OutcomeCategory::TimeoutSignals => &self.timeout_signals,
            OutcomeCategory::FewSignals => &self.few_signals,
            OutcomeCategory::Failed => &self.failed,
        }
    }

    fn ids_mut(&mut self, category: OutcomeCategory) -> &mut BTreeSet<JobId> {
        match category {
            OutcomeCategory::Success => &mut self.success,
            OutcomeCategory::Error => &mut self.error,
            OutcomeCategory::TimeoutSignals => &mut self.timeout_signals,
            OutcomeCategory::FewSignals => &mut self.few_signals,
            OutcomeCategory::Failed => &mut self.failed,
        }
    }

    /// add a record, replacing any earlier record of the same job in this document
    pub fn record(&mut self, record: OutcomeRecord) {
        for category in OutcomeCategory::ALL {
            self.ids_mut(category).remove(&record.job_id);
        }

        self.ids_mut(record.category).insert(record.job_id);
        self.details.insert(record.job_id, record.detail);
    }

    /// category of every job in this document
    pub fn categories(&self) -> impl Iterator<Item = (JobId, OutcomeCategory)> + '_ {
        OutcomeCategory::ALL
            .into_iter()
            .flat_map(move |category| self.ids(category).iter().map(move |id| (*id, category)))
    }

    pub fn len(&self) -> usize {
        OutcomeCategory::ALL
            .iter()
            .map(|category| self.ids(*category).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> BTreeMap<OutcomeCategory, usize> {
        OutcomeCategory::ALL
            .into_iter()
            .map(|category| (category, self.ids(category).len()))
            .collect()
    }

    /// file name of this document in `dir`, names sort by creation time
    pub fn path(&self, dir: &Path, tag: &str) -> PathBuf {
        dir.join(format!(
            "outcomes_{}_{tag}.json",
            self.created_at.format("%Y%m%dT%H%M%S%.3fZ")
        ))
    }

    pub fn save(&self, dir: &Path, tag: &str) -> Result<PathBuf, OutcomeError> {
        let path = self.path(dir, tag);
        write_json_atomic(&path, self)?;

        debug!(path = ?path, jobs = self.len(), "Saved outcome document");

        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, OutcomeError> {
        let content = fs::read(path).map_err(|source| OutcomeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_slice(&content).map_err(|source| OutcomeError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Outcome document of one worker during one run, rewritten after every record so a
/// crashed worker still leaves the outcomes of its finished jobs behind
#[derive(Debug)]
pub struct OutcomeSink {
    dir: PathBuf,
    tag: String,
    document: OutcomeDocument,
}

impl OutcomeSink {
    pub fn new(dir: &Path, run_started: DateTime<Utc>, worker: WorkerId) -> Self {
        Self {
            dir: dir.to_path_buf(),
            tag: format!("w{worker}"),
            document: OutcomeDocument::new(run_started),
        }
    }

    pub fn record(&mut self, record: OutcomeRecord) {
        info!(
            job = record.job_id,
            category = %record.category,
            detail = %record.detail,
            "Classified job"
        );
        self.document.record(record);

        if let Err(error) = self.document.save(&self.dir, &self.tag) {
            warn!(error = %error, "Failed to persist outcome document, retrying with the next record");
        }
    }

    pub fn document(&self) -> &OutcomeDocument {
        &self.document
    }

    pub fn path(&self) -> PathBuf {
        self.document.path(&self.dir, &self.tag)
    }
}

/// Latest outcome per job over all classification runs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutcomeHistory {
    latest: BTreeMap<JobId, (DateTime<Utc>, OutcomeCategory)>,
}

impl OutcomeHistory {
    /// merge every outcome document in `dir`, a missing directory is an empty history
    pub fn load_dir(dir: &Path) -> Result<Self, OutcomeError> {
        let mut history = Self::default();

        for path in matching_files(dir, OUTCOME_GLOB)? {
            let document = OutcomeDocument::load(&path)?;
            debug!(path = ?path, jobs = document.len(), "Merging outcome document");

            history.merge(&document);
        }

        Ok(history)
    }

    /// newer records supersede older ones, equal timestamps keep the first merged record
    pub fn merge(&mut self, document: &OutcomeDocument) {
        for (job, category) in document.categories() {
            match self.latest.get(&job) {
                Some((seen, _)) if *seen >= document.created_at => {}
                _ => {
                    self.latest.insert(job, (document.created_at, category));
                }
            }
        }
    }

    pub fn latest(&self, job: JobId) -> Option<OutcomeCategory> {
        self.latest.get(&job).map(|(_, category)| *category)
    }

    /// jobs whose most recent outcome isn't a success
    pub fn problem_ids(&self) -> BTreeSet<JobId> {
        self.latest
            .iter()
            .filter(|(_, (_, category))| !category.is_success())
            .map(|(job, _)| *job)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
