//! Block-allocating region file: one file holding up to `entries` variable-length blobs.
//!
//! Entries live in runs of fixed-size blocks after a fixed-size header. Every write goes to a
//! freshly allocated run and the entry is switched over only after the bytes are on disk, so a
//! failed write leaves the previous bytes in place. The allocation table is kept in memory and
//! written back to the header on close, on [`RegionFile::flush`], and whenever enough released
//! blocks are waiting to be reused.

mod alloc;
mod header;
mod lock;
mod positioned;
mod stream;

pub use alloc::BlockRun;
pub use header::{EntryRecord, HEADER_MAGIC, HEADER_VERSION};
pub use stream::{EntryReader, EntryWriter};

use crate::blob_array::{BlobArray, ContainerState};
use crate::config::RegionFileConfig;
use crate::error::StoreError;
use alloc::BlockAllocator;
use lock::{EntryLock, StreamCounter};
use positioned::{read_exact_at, write_all_at};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

const PHASE_OPEN: u8 = 0;
const PHASE_CLOSING: u8 = 1;
const PHASE_CLOSED: u8 = 2;

#[derive(Debug)]
struct AllocationTable {
    entries: Vec<Option<EntryRecord>>,
    allocator: BlockAllocator,
    /// Blocks referenced by present entries.
    live_blocks: u64,
    /// Whole body blocks the file is currently sized for.
    file_blocks: u64,
    /// Generation of the newest header copy on disk.
    generation: u64,
    dirty: bool,
}

impl AllocationTable {
    /// Points `index` at `record` and parks the run it referenced before.
    fn replace(&mut self, index: usize, record: Option<EntryRecord>) {
        let previous = std::mem::replace(&mut self.entries[index], record);
        if let Some(record) = record {
            self.live_blocks += record.run.count as u64;
        }
        if let Some(previous) = previous {
            self.live_blocks -= previous.run.count as u64;
            self.allocator.release(previous.run);
        }
        self.dirty = true;
    }

    /// Released blocks have caught up with live data, or with `floor` for small files.
    fn wants_checkpoint(&self, floor: u64) -> bool {
        let pending = self.allocator.pending_blocks();
        pending > 0 && pending >= self.live_blocks.max(floor)
    }
}

/// Location of one present entry, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub index: usize,
    pub run: BlockRun,
    pub byte_len: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RegionFileStats {
    pub present_entries: usize,
    pub used_blocks: u64,
    pub free_blocks: u64,
    /// Separate free runs; higher means more fragmented.
    pub free_runs: usize,
    pub pending_blocks: u64,
    pub end_block: u32,
}

pub struct RegionFile {
    path: PathBuf,
    config: RegionFileConfig,
    header_len: u64,
    file: RwLock<Option<File>>,
    table: Mutex<AllocationTable>,
    /// Held for a whole checkpoint so header copies are written in generation order.
    checkpoint_lock: Mutex<()>,
    locks: Box<[EntryLock]>,
    streams: StreamCounter,
    phase: AtomicU8,
}

impl fmt::Debug for RegionFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionFile")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("open_streams", &self.streams.open_streams())
            .finish_non_exhaustive()
    }
}

impl RegionFile {
    /// Opens or creates the region file at `path`.
    ///
    /// A file without a recognizable header opens as an empty region.
    pub fn open(path: impl Into<PathBuf>, config: RegionFileConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let header_len = header::header_len(&config);
        let (generation, entries) = load_entries(&path, &file, &config, header_len, file_len)?;

        let allocator =
            BlockAllocator::from_used_runs(entries.iter().flatten().map(|record| record.run));
        let file_blocks = file_len.saturating_sub(header_len) / config.block_size();
        let live_blocks = entries
            .iter()
            .flatten()
            .map(|record| record.run.count as u64)
            .sum();
        log::debug!(
            "{}: opened region file, {} entries present, {} blocks",
            path.display(),
            entries.iter().flatten().count(),
            allocator.end_block()
        );

        let locks = (0..config.entry_count())
            .map(|_| EntryLock::default())
            .collect();
        Ok(Self {
            path,
            header_len,
            file: RwLock::new(Some(file)),
            table: Mutex::new(AllocationTable {
                entries,
                allocator,
                live_blocks,
                file_blocks,
                generation,
                dirty: false,
            }),
            checkpoint_lock: Mutex::new(()),
            locks,
            streams: StreamCounter::new(),
            phase: AtomicU8::new(PHASE_OPEN),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RegionFileConfig {
        &self.config
    }

    pub fn entry_count(&self) -> usize {
        self.locks.len()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open_streams()
    }

    pub fn state(&self) -> ContainerState {
        match self.phase.load(Ordering::Acquire) {
            PHASE_OPEN => ContainerState::Open,
            PHASE_CLOSING => ContainerState::Closing,
            _ => ContainerState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ContainerState::Closed
    }

    /// Holds the file in the closing phase, as a close in progress would.
    #[cfg(test)]
    pub(crate) fn hold_closing(&self, closing: bool) {
        let phase = if closing { PHASE_CLOSING } else { PHASE_OPEN };
        self.phase.store(phase, Ordering::Release);
    }

    /// Takes the read lock on `index` and returns its committed bytes, empty if never written.
    pub fn open_read(&self, index: usize) -> Result<EntryReader<'_>, StoreError> {
        self.check_index(index)?;
        let guard = self.locks[index].read(&self.streams)?;
        let bytes = self.load(index)?.unwrap_or_default();
        Ok(EntryReader::new(guard, bytes))
    }

    /// Takes the exclusive lock on `index`. The entry is replaced when the writer is closed.
    pub fn open_write(&self, index: usize) -> Result<EntryWriter<'_>, StoreError> {
        self.check_index(index)?;
        let guard = self.locks[index].write(&self.streams)?;
        Ok(EntryWriter::new(self, index, guard))
    }

    /// Committed bytes of `index`, or `None` if the entry is absent.
    pub fn read_entry(&self, index: usize) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_index(index)?;
        let _guard = self.locks[index].read(&self.streams)?;
        self.load(index)
    }

    pub fn write_entry(&self, index: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let mut writer = self.open_write(index)?;
        writer.write_all(bytes)?;
        writer.close()
    }

    pub fn exists(&self, index: usize) -> Result<bool, StoreError> {
        self.check_index(index)?;
        let _guard = self.locks[index].read(&self.streams)?;
        Ok(self.table().entries[index].is_some())
    }

    /// Removes `index`, returning whether it was present. Its blocks become reusable after the
    /// next header checkpoint.
    pub fn delete(&self, index: usize) -> Result<bool, StoreError> {
        self.check_index(index)?;
        let _guard = self.locks[index].write(&self.streams)?;
        let needs_checkpoint = {
            let mut table = self.table();
            if table.entries[index].is_none() {
                return Ok(false);
            }
            table.replace(index, None);
            table.wants_checkpoint(self.config.checkpoint_pending_blocks as u64)
        };
        if needs_checkpoint {
            self.checkpoint_released();
        }
        Ok(true)
    }

    /// Writes the allocation table to the header while staying open.
    pub fn flush(&self) -> Result<(), StoreError> {
        let _ticket = self.streams.acquire()?;
        self.checkpoint()
    }

    /// Closes the file if no entry stream is open. Never waits for one to finish.
    pub fn attempt_close(&self) -> Result<bool, StoreError> {
        if self.is_closed() {
            return Ok(true);
        }
        if !self.streams.try_close() {
            return Ok(false);
        }
        self.phase.store(PHASE_CLOSING, Ordering::Release);
        if let Err(error) = self.checkpoint() {
            self.phase.store(PHASE_OPEN, Ordering::Release);
            self.streams.reopen();
            return Err(error);
        }
        let file = self.file_write().take();
        drop(file);
        self.phase.store(PHASE_CLOSED, Ordering::Release);
        log::debug!("{}: closed region file", self.path.display());
        Ok(true)
    }

    /// True once no stream has been open for the configured idle timeout.
    pub fn is_timed_out(&self) -> bool {
        !self.streams.is_closed()
            && self.streams.open_streams() == 0
            && self.streams.idle_for() >= self.config.idle_timeout()
    }

    pub fn close_if_timed_out(&self) -> Result<bool, StoreError> {
        if self.is_timed_out() {
            self.attempt_close()
        } else {
            Ok(false)
        }
    }

    /// Present entries ordered by index.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.table()
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry.map(|record| EntryInfo {
                    index,
                    run: record.run,
                    byte_len: record.byte_len,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> RegionFileStats {
        let table = self.table();
        RegionFileStats {
            present_entries: table.entries.iter().flatten().count(),
            used_blocks: table.live_blocks,
            free_blocks: table.allocator.free_blocks(),
            free_runs: table.allocator.free_run_count(),
            pending_blocks: table.allocator.pending_blocks(),
            end_block: table.allocator.end_block(),
        }
    }

    pub(crate) fn commit(&self, index: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let too_large = || StoreError::EntryTooLarge {
            index,
            len: bytes.len(),
        };
        let byte_len = u32::try_from(bytes.len()).map_err(|_| too_large())?;
        let block_size = self.config.block_size();
        let block_count =
            u32::try_from((byte_len as u64).div_ceil(block_size)).map_err(|_| too_large())?;

        let file_guard = self.file_read();
        let file = file_guard.as_ref().ok_or(StoreError::Closed)?;

        let run = {
            let mut table = self.table();
            let run = table
                .allocator
                .allocate(block_count)
                .ok_or(StoreError::RegionFull)?;
            if run.end() > table.file_blocks {
                if let Err(error) = file.set_len(self.header_len + run.end() * block_size) {
                    table.allocator.release_unpublished(run);
                    return Err(error.into());
                }
                table.file_blocks = run.end();
            }
            run
        };

        let written = self.write_run(file, run, bytes);
        drop(file_guard);
        let needs_checkpoint = {
            let mut table = self.table();
            if let Err(error) = written {
                table.allocator.release_unpublished(run);
                return Err(error);
            }
            table.replace(index, Some(EntryRecord { run, byte_len }));
            table.wants_checkpoint(self.config.checkpoint_pending_blocks as u64)
        };
        if needs_checkpoint {
            self.checkpoint_released();
        }
        Ok(())
    }

    /// Checkpoint triggered by a commit. The commit itself already succeeded, so a failure only
    /// leaves the released runs pending for the next attempt.
    fn checkpoint_released(&self) {
        if let Err(error) = self.checkpoint() {
            log::warn!(
                "{}: header checkpoint after commit failed: {error}",
                self.path.display()
            );
        }
    }

    fn write_run(&self, file: &File, run: BlockRun, bytes: &[u8]) -> Result<(), StoreError> {
        if !bytes.is_empty() {
            write_all_at(file, bytes, self.block_offset(run.start))?;
        }
        if self.config.sync_on_commit {
            file.sync_data()?;
        }
        Ok(())
    }

    fn load(&self, index: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(record) = self.table().entries[index] else {
            return Ok(None);
        };
        let mut bytes = vec![0u8; record.byte_len as usize];
        if !bytes.is_empty() {
            let file_guard = self.file_read();
            let file = file_guard.as_ref().ok_or(StoreError::Closed)?;
            read_exact_at(file, &mut bytes, self.block_offset(record.run.start))?;
        }
        Ok(Some(bytes))
    }

    /// Persists the table into the older header copy, then frees the runs released before the
    /// snapshot was taken.
    fn checkpoint(&self) -> Result<(), StoreError> {
        let _serial = self
            .checkpoint_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (generation, header, pending) = {
            let mut table = self.table();
            if !table.dirty && table.allocator.pending_blocks() == 0 {
                return Ok(());
            }
            table.dirty = false;
            let generation = table.generation + 1;
            (
                generation,
                header::encode_header(&self.config, generation, &table.entries),
                table.allocator.take_pending(),
            )
        };

        let offset = header::copy_offset(&self.config, generation);
        let written = match self.file_read().as_ref() {
            Some(file) => write_header(file, offset, &header).map_err(StoreError::from),
            None => Err(StoreError::Closed),
        };

        let mut table = self.table();
        match written {
            Ok(()) => {
                table.generation = generation;
                table.allocator.reclaim(pending);
                Ok(())
            }
            Err(error) => {
                table.dirty = true;
                table.allocator.restore_pending(pending);
                Err(error)
            }
        }
    }

    fn check_index(&self, index: usize) -> Result<(), StoreError> {
        if index < self.locks.len() {
            Ok(())
        } else {
            Err(StoreError::IndexOutOfRange {
                index,
                entries: self.locks.len(),
            })
        }
    }

    fn block_offset(&self, block: u32) -> u64 {
        self.header_len + block as u64 * self.config.block_size()
    }

    fn table(&self) -> MutexGuard<'_, AllocationTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn file_read(&self) -> RwLockReadGuard<'_, Option<File>> {
        self.file
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn file_write(&self) -> RwLockWriteGuard<'_, Option<File>> {
        self.file
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RegionFile {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        match self.attempt_close() {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "{}: region file dropped with open streams",
                self.path.display()
            ),
            Err(error) => log::warn!(
                "{}: failed to close region file on drop: {error}",
                self.path.display()
            ),
        }
    }
}

impl BlobArray for RegionFile {
    fn entry_count(&self) -> usize {
        RegionFile::entry_count(self)
    }

    fn open_read(&self, index: usize) -> Result<Option<EntryReader<'_>>, StoreError> {
        RegionFile::open_read(self, index).map(Some)
    }

    fn open_write(&self, index: usize) -> Result<Option<EntryWriter<'_>>, StoreError> {
        RegionFile::open_write(self, index).map(Some)
    }

    fn exists(&self, index: usize) -> Result<bool, StoreError> {
        RegionFile::exists(self, index)
    }

    fn delete(&self, index: usize) -> Result<bool, StoreError> {
        RegionFile::delete(self, index)
    }

    fn attempt_close(&self) -> Result<bool, StoreError> {
        RegionFile::attempt_close(self)
    }

    fn is_timed_out(&self) -> bool {
        RegionFile::is_timed_out(self)
    }

    fn close_if_timed_out(&self) -> Result<bool, StoreError> {
        RegionFile::close_if_timed_out(self)
    }

    fn state(&self) -> ContainerState {
        RegionFile::state(self)
    }
}

fn load_entries(
    path: &Path,
    file: &File,
    config: &RegionFileConfig,
    header_len: u64,
    file_len: u64,
) -> io::Result<(u64, Vec<Option<EntryRecord>>)> {
    let empty = (0, vec![None; config.entry_count()]);
    if file_len == 0 {
        return Ok(empty);
    }

    let mut bytes = vec![0u8; header_len.min(file_len) as usize];
    read_exact_at(file, &mut bytes, 0)?;
    match header::decode_header(config, &bytes, file_len) {
        Ok(decoded) => {
            if let Some(reason) = &decoded.rejected {
                log::debug!(
                    "{}: using header generation {}, other copy unusable: {reason}",
                    path.display(),
                    decoded.generation
                );
            }
            if !decoded.discarded.is_empty() {
                log::warn!(
                    "{}: discarded {} inconsistent header slots {:?}",
                    path.display(),
                    decoded.discarded.len(),
                    decoded.discarded
                );
            }
            Ok((decoded.generation, decoded.entries))
        }
        Err(reason) => {
            log::warn!(
                "{}: {reason}; opening as an empty region file",
                path.display()
            );
            Ok(empty)
        }
    }
}

fn write_header(file: &File, offset: u64, header: &[u8]) -> io::Result<()> {
    file.sync_data()?;
    write_all_at(file, header, offset)?;
    file.sync_data()
}
