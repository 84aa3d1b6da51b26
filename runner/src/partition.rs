use crate::catalogue::JobId;
use itertools::Itertools;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Partitioning requires at least one node")]
    NoNodes,
}

/// Contiguous slice of pending job ids assigned to one worker
pub type Chunk = Vec<JobId>;

/// Split the pending jobs into at most `nodes` contiguous chunks in ascending id order.
///
/// Chunks are balanced: the first `len % nodes` chunks hold one id more than the
/// rest, so the first chunk always holds `ceil(len / nodes)` ids and no chunk is
/// longer than one before it. Empty chunks are never produced, i.e., fewer jobs
/// than nodes yields one single-id chunk per job.
///
/// The result only depends on `to_run` and `nodes`, which keeps the first id of
/// each chunk reproducible for recovery.
pub fn partition(to_run: &BTreeSet<JobId>, nodes: usize) -> Result<Vec<Chunk>, PartitionError> {
    if nodes == 0 {
        return Err(PartitionError::NoNodes);
    }

    let ids = to_run.iter().copied().collect_vec();
    let base = ids.len() / nodes;
    let extra = ids.len() % nodes;

    let mut chunks = Vec::with_capacity(nodes.min(ids.len()));
    let mut rest = ids.as_slice();

    for index in 0..nodes {
        let size = base + usize::from(index < extra);

        if size == 0 {
            break;
        }

        let (chunk, remaining) = rest.split_at(size);
        chunks.push(chunk.to_vec());
        rest = remaining;
    }

    debug_assert!(rest.is_empty());

    Ok(chunks)
}

/// First id of every chunk, the jobs a stalled worker most likely hangs on
pub fn chunk_heads(chunks: &[Chunk]) -> BTreeSet<JobId> {
    chunks.iter().filter_map(|chunk| chunk.first().copied()).collect()
}
