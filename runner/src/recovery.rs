use crate::{
    catalogue::JobId,
    distributed::fs::{registered_pids, FsError},
    ledger::Ledger,
    partition::{chunk_heads, partition, Chunk, PartitionError},
};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Jobs suspected of hanging the workers of the last run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub chunks: Vec<Chunk>,
    /// first job of every chunk
    pub candidates: BTreeSet<JobId>,
}

/// Reproduce the partitioning of the last run from the saved ledger and collect the chunk heads.
///
/// The ledger has to be the one the run started from, a freshly recomputed ledger may
/// partition differently.
pub fn plan_recovery(ledger: &Ledger, nodes: usize) -> Result<RecoveryPlan, PartitionError> {
    let chunks = partition(&ledger.to_run, nodes)?;
    let candidates = chunk_heads(&chunks);

    debug!(candidates = ?candidates, "Planned recovery");

    Ok(RecoveryPlan { chunks, candidates })
}

impl RecoveryPlan {
    /// the ledger with all candidates blocked
    pub fn apply(&self, ledger: &Ledger) -> Ledger {
        ledger.with_blocked(&self.candidates)
    }
}

/// What happened to the registered processes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Termination {
    pub signalled: Vec<i32>,
    /// pid files of processes that were already gone, removed
    pub stale: Vec<PathBuf>,
    pub failed: Vec<(i32, String)>,
}

/// Send SIGTERM to every process registered in `pid_dir` except `own_pid`
pub fn terminate_registered(pid_dir: &Path, own_pid: i32) -> Result<Termination, FsError> {
    let mut termination = Termination::default();

    for (path, pid) in registered_pids(pid_dir)? {
        if pid == own_pid {
            continue;
        }

        // 0 and negative pids address whole process groups
        if pid <= 0 {
            warn!(pid, path = ?path, "Ignoring pid file with an invalid pid");
            termination.failed.push((pid, "invalid pid".to_string()));
            continue;
        }

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, path = ?path, "Sent SIGTERM");
                termination.signalled.push(pid);
            }
            Err(Errno::ESRCH) => {
                info!(pid, path = ?path, "Process is already gone, removing stale pid file");

                if let Err(error) = fs::remove_file(&path) {
                    warn!(path = ?path, error = %error, "Failed to remove stale pid file");
                }
                termination.stale.push(path);
            }
            Err(errno) => {
                warn!(pid, error = %errno, "Failed to signal process");
                termination.failed.push((pid, errno.to_string()));
            }
        }
    }

    Ok(termination)
}
