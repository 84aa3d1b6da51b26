use super::util::ensure_dir;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::{
    ffi::{OsStr, OsString},
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Prefix of the hidden sibling a file is written to before it is renamed over its target
pub static WRITING_PREFIX: Lazy<OsString> = Lazy::new(|| {
    let mut string = OsString::new();
    string.push(".[writing]_");
    string
});

pub const PID_SUFFIX: &str = ".pid";

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O failed for {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to serialize document")]
    Serialize(#[from] serde_json::Error),
}

impl FsError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Path of the temporary sibling used while writing `path`
fn writing_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().unwrap_or(OsStr::new("unnamed"));
    let mut temp_name = WRITING_PREFIX.clone();
    temp_name.push(file_name);
    temp_name.push(format!(".{}", std::process::id()));

    path.with_file_name(temp_name)
}

/// Overwrite `path` with `bytes` so that readers either see the old or the new content
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).map_err(|error| FsError::io(parent, error))?;
    }

    let temp = writing_path(path);
    let result = File::create(&temp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp, path));

    if let Err(error) = result {
        // don't leave half written siblings behind
        let _ = fs::remove_file(&temp);

        return Err(FsError::io(path, error));
    }

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let bytes = serde_json::to_vec_pretty(value)?;

    write_atomic(path, &bytes)
}

/// Registration of a running process in the pid directory, removed again on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// register the current process as `<dir>/<name>.pid`
    pub fn register(dir: &Path, name: &str) -> Result<Self, FsError> {
        let path = dir.join(format!("{name}{PID_SUFFIX}"));

        if path.exists() {
            warn!(path = ?path, "Overwriting existing pid file, a previous process might still run");
        }

        write_atomic(&path, std::process::id().to_string().as_bytes())?;
        debug!(path = ?path, "Registered pid file");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed pid file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to remove pid file"),
        }
    }
}

/// All processes registered in `dir` as (pid file, pid), unparsable files are skipped
pub fn registered_pids(dir: &Path) -> Result<Vec<(PathBuf, i32)>, FsError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(FsError::io(dir, error)),
    };

    let mut pids = Vec::new();

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();

        if path.extension() != Some(OsStr::new("pid")) {
            continue;
        }

        match fs::read_to_string(&path)
            .ok()
            .and_then(|content| content.trim().parse::<i32>().ok())
        {
            Some(pid) => pids.push((path, pid)),
            None => warn!(path = ?path, "Skipping unreadable pid file"),
        }
    }

    pids.sort();

    Ok(pids)
}
