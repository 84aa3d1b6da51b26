use crate::{
    catalogue::JobId,
    distributed::{
        fs::{write_json_atomic, FsError},
        util::{id_path, parse_id},
    },
    metrics::Metrics,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const CHECKPOINT_PREFIX: &str = "worker_";
pub const CHECKPOINT_SUFFIX: &str = "_checkpoint.json";

pub type WorkerId = u32;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint: {0}")]
    Write(#[from] FsError),
    #[error("Failed to access checkpoint directory {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Position of a worker in its state machine
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Checkpointing,
    Done,
}

/// Latest progress snapshot of a single worker, overwritten on every write
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub job_label: String,
    pub start_time: DateTime<Utc>,
    pub current_combo_index: usize,
    pub total_combos: usize,
    pub best_metrics: Option<Metrics>,
    pub state: WorkerState,
    pub updated_at: DateTime<Utc>,
    /// jobs of the chunk finished before the current one
    pub chunk_position: usize,
    pub chunk_len: usize,
}

impl Checkpoint {
    pub fn progress_pct(&self) -> f64 {
        if self.total_combos == 0 {
            0.0
        } else {
            self.current_combo_index as f64 / self.total_combos as f64 * 100.0
        }
    }

    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        now - self.start_time
    }
}

/// Result of reading a single checkpoint file
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointRead {
    /// worker hasn't written anything yet
    Missing,
    /// file exists but couldn't be read or parsed, retry on the next tick
    Unreadable(String),
    Present(Box<Checkpoint>),
}

/// Directory holding one checkpoint file per worker
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, worker: WorkerId) -> PathBuf {
        id_path(&self.dir, CHECKPOINT_PREFIX, worker, CHECKPOINT_SUFFIX)
    }

    /// overwrite the worker's checkpoint atomically
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path(checkpoint.worker_id);
        write_json_atomic(&path, checkpoint)?;

        trace!(
            worker = checkpoint.worker_id,
            job = checkpoint.job_id,
            combo = checkpoint.current_combo_index,
            "Wrote checkpoint"
        );

        Ok(())
    }

    pub fn read(&self, worker: WorkerId) -> CheckpointRead {
        let path = self.path(worker);

        match fs::read(&path) {
            Ok(content) => match serde_json::from_slice::<Checkpoint>(&content) {
                Ok(checkpoint) => CheckpointRead::Present(Box::new(checkpoint)),
                Err(error) => {
                    debug!(path = ?path, error = %error, "Checkpoint not parsable, skipping for now");

                    CheckpointRead::Unreadable(error.to_string())
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => CheckpointRead::Missing,
            Err(error) => {
                debug!(path = ?path, error = %error, "Checkpoint not readable, skipping for now");

                CheckpointRead::Unreadable(error.to_string())
            }
        }
    }

    /// ids of all workers that have a checkpoint file, in ascending order
    pub fn workers(&self) -> Result<Vec<WorkerId>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut workers = entries
            .filter_map(Result::ok)
            .filter_map(|entry| parse_id(&entry.file_name(), CHECKPOINT_PREFIX, CHECKPOINT_SUFFIX))
            .collect::<Vec<_>>();
        workers.sort_unstable();

        Ok(workers)
    }

    /// remove checkpoints left behind by a previous run
    pub fn clear(&self) -> Result<usize, CheckpointError> {
        let mut removed = 0;

        for worker in self.workers()? {
            let path = self.path(worker);

            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => warn!(path = ?path, error = %error, "Failed to remove stale checkpoint"),
            }
        }

        Ok(removed)
    }
}
