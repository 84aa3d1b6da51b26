use crate::{
    catalogue::{JobId, ParameterSet},
    distributed::{
        fs::{write_json_atomic, FsError},
        util::{id_path, matching_files, parse_id},
    },
    metrics::{Metrics, RankingKey},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const ARTIFACT_PREFIX: &str = "job_";
pub const ARTIFACT_SUFFIX: &str = ".json";
pub const ARTIFACT_GLOB: &str = "job_*.json";

/// Output of a successfully tested job, its existence marks the job as done
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ResultArtifact {
    pub job_id: JobId,
    pub job_label: String,
    pub ranking: RankingKey,
    pub parameters: ParameterSet,
    pub metrics: Metrics,
    pub signals: u64,
    pub total_combos: usize,
    pub evaluated: usize,
    pub errors: usize,
    pub finished_at: DateTime<Utc>,
}

/// Directory of job id addressed result artifacts
#[derive(Clone, Debug)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, job: JobId) -> PathBuf {
        id_path(&self.dir, ARTIFACT_PREFIX, job, ARTIFACT_SUFFIX)
    }

    pub fn exists(&self, job: JobId) -> bool {
        self.path(job).is_file()
    }

    pub fn write(&self, artifact: &ResultArtifact) -> Result<PathBuf, FsError> {
        let path = self.path(artifact.job_id);
        write_json_atomic(&path, artifact)?;

        debug!(job = artifact.job_id, path = ?path, "Wrote result artifact");

        Ok(path)
    }

    /// ids of all jobs with an artifact, only existence is checked
    pub fn scan(&self) -> Result<BTreeSet<JobId>, globset::Error> {
        let ids = matching_files(&self.dir, ARTIFACT_GLOB)?
            .into_iter()
            .filter_map(|path| {
                path.file_name()
                    .and_then(|name| parse_id(name, ARTIFACT_PREFIX, ARTIFACT_SUFFIX))
            })
            .collect::<BTreeSet<_>>();

        info!(dir = ?self.dir, artifacts = ids.len(), "Scanned result artifacts");

        Ok(ids)
    }
}
