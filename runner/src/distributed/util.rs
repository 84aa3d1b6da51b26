use crate::catalogue::JobId;
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};
use tracing::{trace, warn};

/// Strip a known prefix and suffix from a file name, `None` if either doesn't match
pub fn strip_affixes<'a>(file_name: &'a OsStr, prefix: &str, suffix: &str) -> Option<&'a str> {
    file_name
        .to_str()
        .and_then(|name| name.strip_prefix(prefix))
        .and_then(|name| name.strip_suffix(suffix))
}

/// Parse the numeric id out of names like `job_42.json` or `worker_3_checkpoint.json`
pub fn parse_id(file_name: &OsStr, prefix: &str, suffix: &str) -> Option<JobId> {
    let id = strip_affixes(file_name, prefix, suffix)?;

    // reject things like `job_+4.json` or `job_ 4.json` that `parse` would partially accept
    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
        trace!(file_name = ?file_name, "Ignoring file with non-numeric id");

        return None;
    }

    id.parse().ok()
}

/// Inverse of `parse_id`
pub fn id_file_name(prefix: &str, id: JobId, suffix: &str) -> String {
    format!("{prefix}{id}{suffix}")
}

/// Join a directory with an id addressed file name
pub fn id_path(dir: &Path, prefix: &str, id: JobId, suffix: &str) -> PathBuf {
    dir.join(id_file_name(prefix, id, suffix))
}

/// Create a directory including all parents, a no-op if it already exists
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        std::fs::create_dir_all(path)
    }
}

/// All regular files directly inside `dir` whose name matches `pattern`, sorted by path.
///
/// Hidden files are skipped, which excludes siblings that are still being written.
/// A missing directory yields no files.
pub fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, globset::Error> {
    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()?
        .compile_matcher();

    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut builder = WalkBuilder::new(dir);
    builder
        .max_depth(Some(1))
        .hidden(false)
        .parents(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false);

    Ok(builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(dir = ?dir, "Failed to list entry: {error}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .sorted()
        .collect_vec())
}
