use crate::{
    checkpoint::{Checkpoint, WorkerId},
    distributed::util::{ensure_dir, id_path},
};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::warn;

pub const LOG_PREFIX: &str = "worker_";
pub const LOG_SUFFIX: &str = ".log";

pub fn progress_log_path(dir: &Path, worker: WorkerId) -> PathBuf {
    id_path(dir, LOG_PREFIX, worker, LOG_SUFFIX)
}

/// Append-only per worker log, every line starts with `[tag]`
#[derive(Debug)]
pub struct ProgressLog {
    file: Option<File>,
    tag: String,
}

impl ProgressLog {
    /// open the log for appending, a failure disables the log instead of stopping the worker
    pub fn open(dir: &Path, worker: WorkerId, tag: &str) -> Self {
        let path = progress_log_path(dir, worker);
        let file = ensure_dir(dir)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));

        match file {
            Ok(file) => Self {
                file: Some(file),
                tag: tag.to_string(),
            },
            Err(error) => {
                warn!(path = ?path, error = %error, "Failed to open progress log, continuing without");

                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            file: None,
            tag: String::new(),
        }
    }

    pub fn line(&mut self, message: &str) {
        if let Some(file) = self.file.as_mut() {
            if let Err(error) = writeln!(file, "[{}] {message}", self.tag) {
                warn!(error = %error, "Failed to append to progress log");
            }
        }
    }

    pub fn checkpoint(&mut self, checkpoint: &Checkpoint) {
        let best = checkpoint
            .best_metrics
            .as_ref()
            .map(|metrics| {
                format!(
                    "sharpe={:.4} return={:.4} trades={}",
                    metrics.sharpe_ratio, metrics.total_return, metrics.trade_count
                )
            })
            .unwrap_or_else(|| "best=none".to_string());

        self.line(&format!(
            "{} worker={} job={} label={} combo={}/{} chunk={}/{} {best}",
            checkpoint.updated_at.to_rfc3339(),
            checkpoint.worker_id,
            checkpoint.job_id,
            checkpoint.job_label,
            checkpoint.current_combo_index,
            checkpoint.total_combos,
            checkpoint.chunk_position,
            checkpoint.chunk_len,
        ));
    }
}

/// Incremental reader of a progress log, only yields complete lines carrying the tag
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    prefix: String,
    offset: u64,
    /// raw bytes after the last newline, decoded once their line is complete
    partial: Vec<u8>,
}

impl LogTail {
    pub fn new(path: PathBuf, tag: &str) -> Self {
        Self {
            path,
            prefix: format!("[{tag}]"),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines appended since the last poll, `None` if the log doesn't exist yet
    pub fn poll(&mut self) -> io::Result<Option<Vec<String>>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            // truncated or replaced, start over
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let read = file.read_to_end(&mut self.partial)?;
        self.offset += read as u64;

        let mut lines = Vec::new();
        while let Some(end) = self.partial.iter().position(|byte| *byte == b'\n') {
            let raw = self.partial.drain(..=end).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim_end_matches('\r');

            if line.starts_with(&self.prefix) {
                lines.push(line.to_string());
            }
        }

        Ok(Some(lines))
    }
}
