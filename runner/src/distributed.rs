pub mod fs;
pub mod util;

#[cfg(test)]
mod fs_test;

/*
 * Coordination between the orchestrator, the workers and the monitor happens
 * exclusively over the file system:
 * -> every worker owns exactly one checkpoint file and one progress log
 * -> results artifacts are addressed by job id and only ever created
 * -> the ledger is owned by a single orchestrating process at a time
 * -> running processes register a pid file so recovery can stop them
 *
 * All writes that a concurrent reader might observe go through
 * `fs::write_atomic`, i.e., write to a hidden sibling and rename over the
 * target. rename(2) is atomic on a single file system, a reader therefore
 * either sees the previous or the new content.
 */
