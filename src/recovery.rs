use std::collections::HashSet;

use crate::block::BlockStore;
use crate::error::Result;
use crate::index::HashDirectory;

/// Summary of a [`sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub live_blocks: u64,
    pub free_blocks: u64,
    pub reclaimed: u64,
}

/// Returns blocks that no chain and no free-list entry reaches to the free
/// list.
///
/// Allocation persists the block header before the new block is linked
/// anywhere, so a crash in between leaks that block. Marking every block
/// reachable from the directory or the free list finds those leaks.
pub fn sweep(blocks: &mut BlockStore, directory: &mut HashDirectory) -> Result<SweepReport> {
    let mut starts = Vec::new();
    directory.for_each_address(|address| starts.push(address))?;

    let mut marked = HashSet::new();
    for start in starts {
        for address in blocks.chain(start)? {
            marked.insert(address);
        }
    }
    let live_blocks = marked.len() as u64;

    let free = blocks.free_list()?;
    let free_blocks = free.len() as u64;
    marked.extend(free);

    let leaked: Vec<u64> = (0..blocks.stats().block_count)
        .map(|index| blocks.address_of(index))
        .filter(|address| !marked.contains(address))
        .collect();
    blocks.reclaim(&leaked)?;

    let report = SweepReport {
        live_blocks,
        free_blocks,
        reclaimed: leaked.len() as u64,
    };
    if report.reclaimed > 0 {
        tracing::info!(
            reclaimed = report.reclaimed,
            live_blocks = report.live_blocks,
            "Reclaimed leaked blocks"
        );
    } else {
        tracing::debug!(
            live_blocks = report.live_blocks,
            free_blocks = report.free_blocks,
            "Block sweep found no leaks"
        );
    }
    Ok(report)
}
