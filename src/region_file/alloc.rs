//! Block-run allocation for the region file body.
//!
//! Runs released while the file is open are parked in a pending list and only become
//! reusable at the next header checkpoint. Until then the header on disk may still point at
//! them, so overwriting their contents could corrupt an entry after a crash.

use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BlockRun {
    pub start: u32,
    pub count: u32,
}

impl BlockRun {
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last block of the run.
    pub fn end(self) -> u64 {
        self.start as u64 + self.count as u64
    }

    pub fn is_empty(self) -> bool {
        self.count == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockAllocator {
    /// Reusable runs keyed by start block; adjacent runs are always merged.
    free_runs: BTreeMap<u32, u32>,
    pending: Vec<BlockRun>,
    end_block: u32,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the allocator from the runs referenced by a loaded header.
    ///
    /// Runs must not overlap. Gaps between them become free space.
    pub fn from_used_runs(runs: impl IntoIterator<Item = BlockRun>) -> Self {
        let mut used: Vec<BlockRun> = runs.into_iter().filter(|run| !run.is_empty()).collect();
        used.sort_unstable_by_key(|run| run.start);

        let mut allocator = Self::new();
        let mut cursor = 0u32;
        for run in used {
            debug_assert!(run.start >= cursor, "overlapping runs passed to allocator");
            if run.start > cursor {
                allocator.insert_free(BlockRun::new(cursor, run.start - cursor));
            }
            cursor = cursor.max(run.start + run.count);
        }
        allocator.end_block = cursor;
        allocator
    }

    pub fn end_block(&self) -> u32 {
        self.end_block
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_runs.values().map(|count| *count as u64).sum()
    }

    pub fn pending_blocks(&self) -> u64 {
        self.pending.iter().map(|run| run.count as u64).sum()
    }

    pub fn free_run_count(&self) -> usize {
        self.free_runs.len()
    }

    /// Smallest free run that fits, otherwise blocks appended past the current end.
    ///
    /// Returns `None` only when appending would overflow the block address space.
    pub fn allocate(&mut self, count: u32) -> Option<BlockRun> {
        if count == 0 {
            return Some(BlockRun::new(self.end_block, 0));
        }

        let best = self
            .free_runs
            .iter()
            .filter(|(_, len)| **len >= count)
            .min_by_key(|(start, len)| (**len, **start))
            .map(|(start, len)| (*start, *len));

        if let Some((start, len)) = best {
            self.free_runs.remove(&start);
            if len > count {
                self.free_runs.insert(start + count, len - count);
            }
            return Some(BlockRun::new(start, count));
        }

        let start = self.end_block;
        self.end_block = start.checked_add(count)?;
        Some(BlockRun::new(start, count))
    }

    /// Returns a run that was allocated but never referenced from the header.
    pub fn release_unpublished(&mut self, run: BlockRun) {
        if !run.is_empty() {
            self.insert_free(run);
        }
    }

    /// Parks a run that the persisted header may still reference.
    pub fn release(&mut self, run: BlockRun) {
        if !run.is_empty() {
            self.pending.push(run);
        }
    }

    /// Takes the pending runs so they can be freed once a header without them is durable.
    pub fn take_pending(&mut self) -> Vec<BlockRun> {
        std::mem::take(&mut self.pending)
    }

    pub fn restore_pending(&mut self, runs: Vec<BlockRun>) {
        self.pending.extend(runs);
    }

    pub fn reclaim(&mut self, runs: impl IntoIterator<Item = BlockRun>) {
        for run in runs {
            self.release_unpublished(run);
        }
    }

    fn insert_free(&mut self, run: BlockRun) {
        let mut start = run.start;
        let mut count = run.count;

        if let Some((&prev_start, &prev_count)) = self.free_runs.range(..start).next_back() {
            if prev_start as u64 + prev_count as u64 == start as u64 {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                count += prev_count;
            }
        }
        let end = start + count;
        if let Some(next_count) = self.free_runs.remove(&end) {
            count += next_count;
        }
        self.free_runs.insert(start, count);
    }
}
