use crate::{
    catalogue::JobId,
    checkpoint::{Checkpoint, WorkerId, WorkerState},
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Progress {
    job_id: JobId,
    combo_index: usize,
    chunk_position: usize,
    since: DateTime<Utc>,
}

/// Remembers when each worker last made progress, across monitor ticks
#[derive(Clone, Debug)]
pub struct StallTracker {
    stall_after: Duration,
    seen: BTreeMap<WorkerId, Progress>,
}

impl StallTracker {
    pub fn new(stall_after: Duration) -> Self {
        Self {
            stall_after,
            seen: BTreeMap::new(),
        }
    }

    /// Record the checkpoint seen at `now`, returns how long the worker has been stuck
    /// if that exceeds the stall threshold
    pub fn observe(&mut self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> Option<Duration> {
        if checkpoint.state == WorkerState::Done {
            self.seen.remove(&checkpoint.worker_id);

            return None;
        }

        let unchanged = self.seen.get(&checkpoint.worker_id).map_or(false, |seen| {
            seen.job_id == checkpoint.job_id
                && seen.combo_index == checkpoint.current_combo_index
                && seen.chunk_position == checkpoint.chunk_position
        });

        if !unchanged {
            self.seen.insert(
                checkpoint.worker_id,
                Progress {
                    job_id: checkpoint.job_id,
                    combo_index: checkpoint.current_combo_index,
                    chunk_position: checkpoint.chunk_position,
                    // the write time is a better lower bound than the first time we saw it
                    since: checkpoint.updated_at.min(now),
                },
            );
        }

        self.seen
            .get(&checkpoint.worker_id)
            .map(|seen| now - seen.since)
            .filter(|stuck| *stuck >= self.stall_after)
    }

    pub fn forget(&mut self, worker: WorkerId) {
        self.seen.remove(&worker);
    }
}
